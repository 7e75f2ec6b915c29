//! Reference API contracts, MediaWiki + fixture-backed clients, and the item feature fetcher.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pacetrack_core::{Assessment, CitationStats, ConfigError, ItemFeatures};
use pacetrack_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pacetrack-adapters";

pub const ENDPOINT_REVISIONS: &str = "revisions";
pub const ENDPOINT_TEMPLATES: &str = "templates";
pub const ENDPOINT_ASSESSMENTS: &str = "assessments";
pub const ENDPOINT_CITATIONS: &str = "citations";
pub const ENDPOINT_WIKIDATA: &str = "wikidata";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid url for {endpoint}: {message}")]
    InvalidUrl {
        endpoint: &'static str,
        message: String,
    },
    #[error("undecodable {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected {endpoint} response: missing `{missing}`")]
    UnexpectedShape {
        endpoint: &'static str,
        missing: &'static str,
    },
    #[error("{endpoint} unavailable: {message}")]
    Unavailable {
        endpoint: &'static str,
        message: String,
    },
}

/// Keyed lookups against the wiki that hosts a campaign's items.
#[async_trait]
pub trait ReferenceApi: Send + Sync {
    fn name(&self) -> &str;

    /// Revision current at `at`, or `None` when the page did not exist yet.
    async fn revision_at(&self, title: &str, at: DateTime<Utc>) -> Result<Option<u64>, ApiError>;

    async fn templates(&self, rev_id: u64) -> Result<Vec<String>, ApiError>;

    async fn assessments(&self, title: &str) -> Result<BTreeMap<String, Assessment>, ApiError>;

    async fn citations(&self, title: &str, rev_id: u64) -> Result<CitationStats, ApiError>;

    async fn wikidata_items(&self, rev_id: u64) -> Result<Vec<String>, ApiError>;
}

pub fn talk_title(title: &str) -> String {
    format!("Talk:{title}")
}

/// Live client for the MediaWiki action API and the REST references endpoint.
#[derive(Debug, Clone)]
pub struct MediaWikiApi {
    http: Arc<HttpFetcher>,
    api_url: String,
    rest_url: String,
    run_id: Uuid,
}

impl MediaWikiApi {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_url: impl Into<String>,
        rest_url: impl Into<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            rest_url: rest_url.into(),
            run_id,
        }
    }

    /// Substitutes `{lang}` in both URL templates.
    pub fn for_lang(
        http: Arc<HttpFetcher>,
        api_template: &str,
        rest_template: &str,
        lang: &str,
        run_id: Uuid,
    ) -> Self {
        Self::new(
            http,
            api_template.replace("{lang}", lang),
            rest_template.replace("{lang}", lang),
            run_id,
        )
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn action_url(&self, endpoint: &'static str, params: &[(&str, &str)]) -> Result<Url, ApiError> {
        Url::parse_with_params(&self.api_url, params).map_err(|e| ApiError::InvalidUrl {
            endpoint,
            message: e.to_string(),
        })
    }

    fn references_url(&self, title: &str, rev_id: u64) -> Result<Url, ApiError> {
        let invalid = |message: String| ApiError::InvalidUrl {
            endpoint: ENDPOINT_CITATIONS,
            message,
        };
        let mut url = Url::parse(&self.rest_url).map_err(|e| invalid(e.to_string()))?;
        let rev = rev_id.to_string();
        let path_title = title.replace(' ', "_");
        url.path_segments_mut()
            .map_err(|_| invalid("rest url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["page", "references", path_title.as_str(), rev.as_str()]);
        Ok(url)
    }

    async fn get_json(&self, endpoint: &'static str, url: Url) -> Result<JsonValue, ApiError> {
        let response = self.http.fetch_bytes(self.run_id, endpoint, url.as_str()).await?;
        serde_json::from_slice(&response.body).map_err(|source| ApiError::Decode { endpoint, source })
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// First page of a legacy (`formatversion=1`) pages object keyed by page id.
fn first_page(pages: &JsonValue) -> Option<&JsonValue> {
    match pages {
        JsonValue::Object(map) => map.values().next(),
        JsonValue::Array(list) => list.first(),
        _ => None,
    }
}

pub fn parse_revision_response(body: &JsonValue) -> Option<u64> {
    let page = first_page(json_at(body, &["query", "pages"])?)?;
    page.get("revisions")?
        .as_array()?
        .first()?
        .get("revid")?
        .as_u64()
}

pub fn parse_templates_response(body: &JsonValue) -> Result<Vec<String>, ApiError> {
    let templates = json_at(body, &["parse", "templates"])
        .and_then(JsonValue::as_array)
        .ok_or(ApiError::UnexpectedShape {
            endpoint: ENDPOINT_TEMPLATES,
            missing: "parse.templates",
        })?;
    Ok(templates
        .iter()
        .filter_map(|t| t.get("*").and_then(JsonValue::as_str))
        .map(|t| t.replace("Template:", ""))
        .collect())
}

pub fn parse_assessments_response(body: &JsonValue) -> BTreeMap<String, Assessment> {
    let Some(found) = json_at(body, &["query", "pages"])
        .and_then(first_page)
        .and_then(|p| p.get("pageassessments"))
    else {
        return BTreeMap::new();
    };
    serde_json::from_value(found.clone()).unwrap_or_default()
}

pub fn parse_wikidata_response(body: &JsonValue) -> Vec<String> {
    let Some(usage) = json_at(body, &["query", "pages"])
        .and_then(first_page)
        .and_then(|p| p.get("wbentityusage"))
        .and_then(JsonValue::as_object)
    else {
        return Vec::new();
    };
    usage
        .iter()
        .filter(|(_, val)| {
            val.get("aspects")
                .and_then(JsonValue::as_array)
                .map(|aspects| aspects.iter().any(|a| a.as_str() == Some("S")))
                .unwrap_or(false)
        })
        .map(|(item, _)| item.clone())
        .collect()
}

/// Counts references and the subset whose rendered HTML links a Wikidata item.
pub fn parse_citations_response(body: &JsonValue) -> CitationStats {
    let Some(references) = body.get("references_by_id").and_then(JsonValue::as_object) else {
        return CitationStats::default();
    };
    let link = match Selector::parse("a[href*='wikidata.org/wiki/Q']") {
        Ok(sel) => sel,
        Err(_) => return CitationStats::default(),
    };
    let reference_wikidata_count = references
        .values()
        .filter_map(|r| json_at(r, &["content", "html"]).and_then(JsonValue::as_str))
        .filter(|html| Html::parse_fragment(html).select(&link).next().is_some())
        .count() as u64;
    CitationStats {
        reference_count: references.len() as u64,
        reference_wikidata_count,
    }
}

pub fn format_api_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl ReferenceApi for MediaWikiApi {
    fn name(&self) -> &str {
        &self.api_url
    }

    async fn revision_at(&self, title: &str, at: DateTime<Utc>) -> Result<Option<u64>, ApiError> {
        let rvstart = format_api_timestamp(at);
        let url = self.action_url(
            ENDPOINT_REVISIONS,
            &[
                ("action", "query"),
                ("prop", "revisions"),
                ("rvprop", "ids"),
                ("format", "json"),
                ("titles", title),
                ("rvlimit", "1"),
                ("rvstart", rvstart.as_str()),
            ],
        )?;
        let body = self.get_json(ENDPOINT_REVISIONS, url).await?;
        Ok(parse_revision_response(&body))
    }

    async fn templates(&self, rev_id: u64) -> Result<Vec<String>, ApiError> {
        let oldid = rev_id.to_string();
        let url = self.action_url(
            ENDPOINT_TEMPLATES,
            &[
                ("action", "parse"),
                ("prop", "templates"),
                ("oldid", oldid.as_str()),
                ("format", "json"),
            ],
        )?;
        let body = self.get_json(ENDPOINT_TEMPLATES, url).await?;
        parse_templates_response(&body)
    }

    async fn assessments(&self, title: &str) -> Result<BTreeMap<String, Assessment>, ApiError> {
        // Assessments are only available for the current revision.
        let url = self.action_url(
            ENDPOINT_ASSESSMENTS,
            &[
                ("action", "query"),
                ("prop", "pageassessments"),
                ("titles", title),
                ("formatversion", "2"),
                ("format", "json"),
            ],
        )?;
        let body = self.get_json(ENDPOINT_ASSESSMENTS, url).await?;
        Ok(parse_assessments_response(&body))
    }

    async fn citations(&self, title: &str, rev_id: u64) -> Result<CitationStats, ApiError> {
        let url = self.references_url(title, rev_id)?;
        let body = self.get_json(ENDPOINT_CITATIONS, url).await?;
        Ok(parse_citations_response(&body))
    }

    async fn wikidata_items(&self, rev_id: u64) -> Result<Vec<String>, ApiError> {
        let revids = rev_id.to_string();
        let url = self.action_url(
            ENDPOINT_WIKIDATA,
            &[
                ("action", "query"),
                ("prop", "wbentityusage"),
                ("revids", revids.as_str()),
                ("format", "json"),
            ],
        )?;
        let body = self.get_json(ENDPOINT_WIKIDATA, url).await?;
        Ok(parse_wikidata_response(&body))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRevision {
    pub rev_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub wikidata_items: Vec<String>,
    #[serde(default)]
    pub citations: Option<CitationStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixturePage {
    #[serde(default)]
    pub revisions: Vec<FixtureRevision>,
    #[serde(default)]
    pub assessments: BTreeMap<String, Assessment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceFixture {
    #[serde(default)]
    pub pages: BTreeMap<String, FixturePage>,
}

pub fn load_reference_fixture(path: impl AsRef<Path>) -> Result<ReferenceFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline `ReferenceApi` answering from a fixture document.
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceApi {
    fixture: ReferenceFixture,
    failing: HashSet<&'static str>,
    latency: HashMap<&'static str, Duration>,
}

impl StaticReferenceApi {
    pub fn new(fixture: ReferenceFixture) -> Self {
        Self {
            fixture,
            ..Self::default()
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_reference_fixture(path)?))
    }

    /// Every call to `endpoint` fails.
    pub fn with_failure(mut self, endpoint: &'static str) -> Self {
        self.failing.insert(endpoint);
        self
    }

    /// Every call to `endpoint` sleeps first.
    pub fn with_latency(mut self, endpoint: &'static str, delay: Duration) -> Self {
        self.latency.insert(endpoint, delay);
        self
    }

    async fn enter(&self, endpoint: &'static str) -> Result<(), ApiError> {
        if let Some(delay) = self.latency.get(endpoint) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(endpoint) {
            return Err(ApiError::Unavailable {
                endpoint,
                message: "configured to fail".to_string(),
            });
        }
        Ok(())
    }

    fn revision(&self, rev_id: u64) -> Option<&FixtureRevision> {
        self.fixture
            .pages
            .values()
            .flat_map(|p| p.revisions.iter())
            .find(|r| r.rev_id == rev_id)
    }
}

#[async_trait]
impl ReferenceApi for StaticReferenceApi {
    fn name(&self) -> &str {
        "static"
    }

    async fn revision_at(&self, title: &str, at: DateTime<Utc>) -> Result<Option<u64>, ApiError> {
        self.enter(ENDPOINT_REVISIONS).await?;
        Ok(self.fixture.pages.get(title).and_then(|page| {
            page.revisions
                .iter()
                .filter(|r| r.timestamp <= at)
                .max_by_key(|r| r.timestamp)
                .map(|r| r.rev_id)
        }))
    }

    async fn templates(&self, rev_id: u64) -> Result<Vec<String>, ApiError> {
        self.enter(ENDPOINT_TEMPLATES).await?;
        self.revision(rev_id)
            .map(|r| r.templates.clone())
            .ok_or(ApiError::UnexpectedShape {
                endpoint: ENDPOINT_TEMPLATES,
                missing: "parse.templates",
            })
    }

    async fn assessments(&self, title: &str) -> Result<BTreeMap<String, Assessment>, ApiError> {
        self.enter(ENDPOINT_ASSESSMENTS).await?;
        Ok(self
            .fixture
            .pages
            .get(title)
            .map(|p| p.assessments.clone())
            .unwrap_or_default())
    }

    async fn citations(&self, _title: &str, rev_id: u64) -> Result<CitationStats, ApiError> {
        self.enter(ENDPOINT_CITATIONS).await?;
        Ok(self
            .revision(rev_id)
            .and_then(|r| r.citations)
            .unwrap_or_default())
    }

    async fn wikidata_items(&self, rev_id: u64) -> Result<Vec<String>, ApiError> {
        self.enter(ENDPOINT_WIKIDATA).await?;
        Ok(self
            .revision(rev_id)
            .map(|r| r.wikidata_items.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// Upper bound for revision resolution and, separately, for the feature fan-out.
    pub bound: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            bound: Duration::from_secs(20),
        }
    }
}

pub const FEATURE_TEMPLATES: &str = "templates";
pub const FEATURE_TALK: &str = "talk";
pub const FEATURE_ASSESSMENTS: &str = "assessments";
pub const FEATURE_CITATIONS: &str = "citations";
pub const FEATURE_WIKIDATA: &str = "wikidata_items";

enum FeaturePart {
    Templates(Result<Vec<String>, ApiError>),
    Talk(Result<(Option<u64>, Vec<String>), ApiError>),
    Assessments(Result<BTreeMap<String, Assessment>, ApiError>),
    Citations(Result<CitationStats, ApiError>),
    Wikidata(Result<Vec<String>, ApiError>),
}

impl FeaturePart {
    fn name(&self) -> &'static str {
        match self {
            Self::Templates(_) => FEATURE_TEMPLATES,
            Self::Talk(_) => FEATURE_TALK,
            Self::Assessments(_) => FEATURE_ASSESSMENTS,
            Self::Citations(_) => FEATURE_CITATIONS,
            Self::Wikidata(_) => FEATURE_WIKIDATA,
        }
    }

    fn apply(self, features: &mut ItemFeatures) -> Result<(), ApiError> {
        match self {
            Self::Templates(r) => features.templates = r?,
            Self::Talk(r) => {
                let (rev, templates) = r?;
                features.talk_rev_id = rev;
                features.talk_templates = templates;
            }
            Self::Assessments(r) => features.assessments = r?,
            Self::Citations(r) => features.citations = Some(r?),
            Self::Wikidata(r) => features.wikidata_items = r?,
        }
        Ok(())
    }
}

/// Features for one item as of `at`. Never fails: unresolvable revisions mean
/// the item did not exist, and failed or late features are listed as missing.
pub async fn fetch_item_features(
    api: Arc<dyn ReferenceApi>,
    title: &str,
    at: DateTime<Utc>,
    policy: FetchPolicy,
) -> ItemFeatures {
    let mut features = ItemFeatures::missing(title, at);

    let rev_id = match tokio::time::timeout(policy.bound, api.revision_at(title, at)).await {
        Ok(Ok(Some(rev_id))) => rev_id,
        Ok(Ok(None)) => {
            debug!(title, %at, "item has no revision at timestamp");
            return features;
        }
        Ok(Err(err)) => {
            debug!(title, error = %err, "revision lookup failed; treating item as absent");
            return features;
        }
        Err(_) => {
            debug!(title, "revision lookup timed out; treating item as absent");
            return features;
        }
    };
    features.rev_id = Some(rev_id);

    let deadline = tokio::time::Instant::now() + policy.bound;
    let mut tasks = JoinSet::new();
    {
        let api = api.clone();
        tasks.spawn(async move { FeaturePart::Templates(api.templates(rev_id).await) });
    }
    {
        let api = api.clone();
        let talk = talk_title(title);
        tasks.spawn(async move {
            let result = match api.revision_at(&talk, at).await {
                Ok(Some(talk_rev)) => api.templates(talk_rev).await.map(|t| (Some(talk_rev), t)),
                Ok(None) => Ok((None, Vec::new())),
                Err(err) => Err(err),
            };
            FeaturePart::Talk(result)
        });
    }
    {
        let api = api.clone();
        let title = title.to_string();
        tasks.spawn(async move { FeaturePart::Assessments(api.assessments(&title).await) });
    }
    {
        let api = api.clone();
        let title = title.to_string();
        tasks.spawn(async move { FeaturePart::Citations(api.citations(&title, rev_id).await) });
    }
    {
        let api = api.clone();
        tasks.spawn(async move { FeaturePart::Wikidata(api.wikidata_items(rev_id).await) });
    }

    let mut pending: BTreeSet<&'static str> = [
        FEATURE_TEMPLATES,
        FEATURE_TALK,
        FEATURE_ASSESSMENTS,
        FEATURE_CITATIONS,
        FEATURE_WIKIDATA,
    ]
    .into_iter()
    .collect();
    let mut failed: Vec<&'static str> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(part))) => {
                let name = part.name();
                pending.remove(name);
                if let Err(err) = part.apply(&mut features) {
                    warn!(title, feature = name, error = %err, "feature fetch failed");
                    failed.push(name);
                }
            }
            Ok(Some(Err(join_err))) => {
                warn!(title, error = %join_err, "feature task did not complete");
            }
            Ok(None) => break,
            Err(_) => {
                tasks.abort_all();
                warn!(title, pending = ?pending, bound = ?policy.bound, "feature fetch bound elapsed");
                break;
            }
        }
    }

    let mut missing = failed;
    missing.extend(pending);
    missing.sort_unstable();
    features.missing_features = missing.into_iter().map(ToString::to_string).collect();
    features
}

/// Item-list source descriptor as written in campaign configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemListConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub title_key: Option<String>,
    #[serde(default)]
    pub list_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemListSource {
    /// JSON array of records (e.g. a saved SPARQL result); `title_key` names the title field.
    JsonRecords { path: PathBuf, title_key: String },
    /// YAML mapping with a top-level list of titles under `list_key`.
    YamlList { path: PathBuf, list_key: String },
}

impl TryFrom<&ItemListConfig> for ItemListSource {
    type Error = ConfigError;

    fn try_from(config: &ItemListConfig) -> Result<Self, Self::Error> {
        let field = |value: &Option<String>, field: &'static str| {
            value.clone().ok_or_else(|| ConfigError::MissingSourceField {
                kind: config.kind.clone(),
                field,
            })
        };
        match config.kind.as_str() {
            "sparql_json_file" => Ok(Self::JsonRecords {
                path: PathBuf::from(field(&config.path, "path")?),
                title_key: field(&config.title_key, "title_key")?,
            }),
            "yaml_file" => Ok(Self::YamlList {
                path: PathBuf::from(field(&config.path, "path")?),
                list_key: field(&config.list_key, "list_key")?,
            }),
            other => Err(ConfigError::UnsupportedItemSource(other.to_string())),
        }
    }
}

impl ItemListSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::JsonRecords { path, .. } | Self::YamlList { path, .. } => path,
        }
    }

    /// Titles in file order, with `path` resolved against `base`.
    pub fn load(&self, base: &Path) -> Result<Vec<String>> {
        let path = base.join(self.path());
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading item list {}", path.display()))?;
        match self {
            Self::JsonRecords { title_key, .. } => {
                let records: Vec<JsonValue> = serde_json::from_str(&data)
                    .with_context(|| format!("parsing item list {}", path.display()))?;
                records
                    .iter()
                    .enumerate()
                    .map(|(idx, record)| {
                        record
                            .get(title_key)
                            .and_then(JsonValue::as_str)
                            .map(|t| t.trim().to_string())
                            .with_context(|| {
                                format!("record {idx} in {} has no string `{title_key}`", path.display())
                            })
                    })
                    .collect()
            }
            Self::YamlList { list_key, .. } => {
                let doc: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing item list {}", path.display()))?;
                let list = doc
                    .get(list_key)
                    .with_context(|| format!("{} has no top-level `{list_key}`", path.display()))?;
                serde_yaml::from_value::<Vec<String>>(list.clone())
                    .with_context(|| format!("`{list_key}` in {} is not a list of titles", path.display()))
            }
        }
    }
}
