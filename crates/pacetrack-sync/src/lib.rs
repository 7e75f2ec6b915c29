//! Campaign state engine: live fetch, snapshot persistence, retention and multi-campaign runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pacetrack_adapters::{FetchPolicy, MediaWikiApi, ReferenceApi, StaticReferenceApi};
use pacetrack_core::{CampaignResults, MetricRegistry};
use pacetrack_storage::{HttpClientConfig, HttpFetcher, PruneReport, RateLimit};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod campaign;
mod state;

pub use campaign::{
    Campaign, CampaignConfig, UpdateError, UpdateOutcome, UpdatePhase, CONFIG_FILE_NAME,
};
pub use state::{goal_deltas, CampaignState, GoalDelta, ItemRecord, StateError};

pub const CRATE_NAME: &str = "pacetrack-sync";

#[derive(Debug, Clone)]
pub struct PacetrackConfig {
    pub campaigns_dir: PathBuf,
    pub static_dir: PathBuf,
    /// Action API URL; `{lang}` is replaced by the campaign language.
    pub api_url: String,
    pub rest_api_url: String,
    /// Serve reference data from a fixture document instead of the network.
    pub api_fixture: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Requests allowed in a burst before throttling; `None` disables the limit.
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_ms: u64,
    pub fetch_bound_secs: u64,
    pub item_concurrency: usize,
    pub scheduler_enabled: bool,
    pub update_cron: String,
}

impl Default for PacetrackConfig {
    fn default() -> Self {
        Self {
            campaigns_dir: PathBuf::from("./campaigns"),
            static_dir: PathBuf::from("./static"),
            api_url: "https://{lang}.wikipedia.org/w/api.php".to_string(),
            rest_api_url: "https://{lang}.wikipedia.org/api/rest_v1/".to_string(),
            api_fixture: None,
            user_agent: format!("pacetrack/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            rate_limit_capacity: None,
            rate_limit_refill_ms: 1_000,
            fetch_bound_secs: 20,
            item_concurrency: 8,
            scheduler_enabled: false,
            update_cron: "0 */15 * * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl PacetrackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            campaigns_dir: std::env::var("PACETRACK_CAMPAIGNS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.campaigns_dir),
            static_dir: std::env::var("PACETRACK_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            api_url: std::env::var("PACETRACK_API_URL").unwrap_or(defaults.api_url),
            rest_api_url: std::env::var("PACETRACK_REST_API_URL").unwrap_or(defaults.rest_api_url),
            api_fixture: std::env::var("PACETRACK_API_FIXTURE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("PACETRACK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PACETRACK_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            rate_limit_capacity: env_parse::<u32>("PACETRACK_RATE_LIMIT_CAPACITY")
                .filter(|capacity| *capacity > 0)
                .or(defaults.rate_limit_capacity),
            rate_limit_refill_ms: env_parse("PACETRACK_RATE_LIMIT_REFILL_MS").unwrap_or(defaults.rate_limit_refill_ms),
            fetch_bound_secs: env_parse("PACETRACK_FETCH_BOUND_SECS").unwrap_or(defaults.fetch_bound_secs),
            item_concurrency: env_parse("PACETRACK_ITEM_CONCURRENCY").unwrap_or(defaults.item_concurrency),
            scheduler_enabled: std::env::var("PACETRACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            update_cron: std::env::var("PACETRACK_UPDATE_CRON").unwrap_or(defaults.update_cron),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: self.rate_limit_capacity.map(|capacity| RateLimit {
                capacity,
                refill_every: Duration::from_millis(self.rate_limit_refill_ms),
            }),
            ..Default::default()
        }
    }
}

/// Listing row and index-page input for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub lang: String,
    pub disabled: bool,
    pub campaign_start_date: NaiveDate,
    pub campaign_end_date: Option<NaiveDate>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub results: Option<CampaignResults>,
}

/// Everything a renderer needs for one campaign page.
#[derive(Debug)]
pub struct CampaignReport<'a> {
    pub summary: CampaignSummary,
    pub config: &'a CampaignConfig,
    pub start_state: &'a CampaignState,
    pub latest_state: &'a CampaignState,
    pub deltas: Vec<GoalDelta>,
}

pub trait ReportRenderer: Send + Sync {
    fn render_campaign(&self, report: &CampaignReport<'_>) -> Result<()>;
    fn render_index(&self, campaigns: &[CampaignSummary]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopRenderer;

impl ReportRenderer for NoopRenderer {
    fn render_campaign(&self, _report: &CampaignReport<'_>) -> Result<()> {
        Ok(())
    }

    fn render_index(&self, _campaigns: &[CampaignSummary]) -> Result<()> {
        Ok(())
    }
}

/// Per-run collaborators handed to every campaign operation.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<PacetrackConfig>,
    pub run_id: Uuid,
    pub registry: Arc<MetricRegistry>,
    http: Arc<HttpFetcher>,
    reference_api: Option<Arc<dyn ReferenceApi>>,
    renderer: Arc<dyn ReportRenderer>,
}

impl RunContext {
    pub fn new(config: PacetrackConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let reference_api = match &config.api_fixture {
            Some(path) => {
                let api = StaticReferenceApi::from_path(path)
                    .with_context(|| format!("loading reference fixture {}", path.display()))?;
                Some(Arc::new(api) as Arc<dyn ReferenceApi>)
            }
            None => None,
        };
        Ok(Self {
            config: Arc::new(config),
            run_id: Uuid::new_v4(),
            registry: Arc::new(MetricRegistry::with_builtins()),
            http: Arc::new(http),
            reference_api,
            renderer: Arc::new(NoopRenderer),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replaces the live MediaWiki client for every language.
    pub fn with_reference_api(mut self, api: Arc<dyn ReferenceApi>) -> Self {
        self.reference_api = Some(api);
        self
    }

    /// Same collaborators under a fresh run id.
    pub fn next_run(&self) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    pub fn renderer(&self) -> &dyn ReportRenderer {
        self.renderer.as_ref()
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            bound: Duration::from_secs(self.config.fetch_bound_secs.max(1)),
        }
    }

    pub fn api_for(&self, lang: &str) -> Arc<dyn ReferenceApi> {
        match &self.reference_api {
            Some(api) => api.clone(),
            None => Arc::new(MediaWikiApi::for_lang(
                self.http.clone(),
                &self.config.api_url,
                &self.config.rest_api_url,
                lang,
                self.run_id,
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CampaignRunStatus {
    Disabled,
    Skipped { next_due: DateTime<Utc> },
    Updated { timestamp: DateTime<Utc>, rendered: bool },
    Failed { phase: UpdatePhase, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignRunRecord {
    pub campaign_id: String,
    #[serde(flatten)]
    pub status: CampaignRunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub campaigns: Vec<CampaignRunRecord>,
    pub index_rendered: bool,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.campaigns
            .iter()
            .filter(|c| matches!(c.status, CampaignRunStatus::Failed { .. }))
            .count()
    }

    pub fn updated(&self) -> usize {
        self.campaigns
            .iter()
            .filter(|c| matches!(c.status, CampaignRunStatus::Updated { .. }))
            .count()
    }
}

/// Campaign directories (those holding a `config.yaml`), in name order.
pub fn campaign_dirs(campaigns_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = std::fs::read_dir(campaigns_dir)
        .with_context(|| format!("reading {}", campaigns_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join(CONFIG_FILE_NAME).is_file())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Finds a campaign by id, matching either the configured id or the directory name.
pub fn find_campaign(ctx: &RunContext, id: &str) -> Result<Campaign> {
    for dir in campaign_dirs(&ctx.config.campaigns_dir)? {
        if dir_label(&dir) == id {
            return Campaign::from_path(&dir, &ctx.registry);
        }
        if let Ok(campaign) = Campaign::from_path(&dir, &ctx.registry) {
            if campaign.id == id {
                return Ok(campaign);
            }
        }
    }
    anyhow::bail!("no campaign `{id}` under {}", ctx.config.campaigns_dir.display())
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignListing {
    pub dir: PathBuf,
    pub summary: Option<CampaignSummary>,
    pub error: Option<String>,
}

/// Every campaign with its latest snapshot, loading errors included rather than raised.
pub async fn list_campaigns(ctx: &RunContext) -> Result<Vec<CampaignListing>> {
    let mut listings = Vec::new();
    for dir in campaign_dirs(&ctx.config.campaigns_dir)? {
        let loaded = async {
            let mut campaign = Campaign::from_path(&dir, &ctx.registry)?;
            campaign.load_latest_state().await?;
            Ok::<_, anyhow::Error>(campaign.summary())
        }
        .await;
        listings.push(match loaded {
            Ok(summary) => CampaignListing {
                dir,
                summary: Some(summary),
                error: None,
            },
            Err(err) => CampaignListing {
                dir,
                summary: None,
                error: Some(format!("{err:#}")),
            },
        });
    }
    Ok(listings)
}

async fn run_campaign(ctx: &RunContext, dir: &Path, force: bool) -> (CampaignRunRecord, Option<CampaignSummary>) {
    let mut campaign = match Campaign::from_path(dir, &ctx.registry) {
        Ok(campaign) => campaign,
        Err(err) => {
            let campaign_id = dir_label(dir);
            error!(campaign = %campaign_id, phase = %UpdatePhase::LoadConfig, error = %format!("{err:#}"), "campaign failed");
            return (
                CampaignRunRecord {
                    campaign_id,
                    status: CampaignRunStatus::Failed {
                        phase: UpdatePhase::LoadConfig,
                        error: format!("{err:#}"),
                    },
                },
                None,
            );
        }
    };

    if campaign.is_disabled() {
        info!(campaign = %campaign.id, "campaign disabled; skipping");
        return (
            CampaignRunRecord {
                campaign_id: campaign.id.clone(),
                status: CampaignRunStatus::Disabled,
            },
            Some(campaign.summary()),
        );
    }

    let status = match campaign.update(ctx, force).await {
        Ok(UpdateOutcome::Disabled) => CampaignRunStatus::Disabled,
        Ok(UpdateOutcome::Skipped { next_due }) => CampaignRunStatus::Skipped { next_due },
        Ok(UpdateOutcome::Updated {
            timestamp, rendered, ..
        }) => CampaignRunStatus::Updated { timestamp, rendered },
        Err(err) => {
            error!(campaign = %err.campaign, phase = %err.phase, error = %format!("{:#}", err.source), "campaign failed");
            CampaignRunStatus::Failed {
                phase: err.phase,
                error: format!("{:#}", err.source),
            }
        }
    };
    (
        CampaignRunRecord {
            campaign_id: campaign.id.clone(),
            status,
        },
        Some(campaign.summary()),
    )
}

/// Updates every campaign in name order. A failing campaign never stops its siblings.
pub async fn update_all(ctx: &RunContext, force: bool) -> Result<RunSummary> {
    let started_at = Utc::now();
    info!(run_id = %ctx.run_id, force, "update run started");

    let mut records = Vec::new();
    let mut summaries = Vec::new();
    for dir in campaign_dirs(&ctx.config.campaigns_dir)? {
        let (record, summary) = run_campaign(ctx, &dir, force).await;
        records.push(record);
        summaries.extend(summary);
    }

    let index_rendered = match ctx.renderer().render_index(&summaries) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "rendering campaign index failed");
            false
        }
    };

    let summary = RunSummary {
        run_id: ctx.run_id,
        started_at,
        finished_at: Utc::now(),
        campaigns: records,
        index_rendered,
    };
    info!(
        run_id = %summary.run_id,
        campaigns = summary.campaigns.len(),
        updated = summary.updated(),
        failed = summary.failed(),
        "update run finished"
    );
    Ok(summary)
}

pub async fn update_one(ctx: &RunContext, id: &str, force: bool) -> Result<UpdateOutcome> {
    let mut campaign = find_campaign(ctx, id)?;
    let outcome = campaign.update(ctx, force).await?;
    Ok(outcome)
}

/// Outcome of a per-campaign maintenance step in a multi-campaign run.
#[derive(Debug, Clone)]
pub enum CampaignTaskStatus<T> {
    Done(T),
    Failed { phase: UpdatePhase, error: String },
}

#[derive(Debug, Clone)]
pub struct CampaignTaskRecord<T> {
    pub campaign_id: String,
    pub status: CampaignTaskStatus<T>,
}

impl<T> CampaignTaskRecord<T> {
    fn failed(campaign_id: String, phase: UpdatePhase, err: &anyhow::Error) -> Self {
        let error = format!("{err:#}");
        error!(campaign = %campaign_id, %phase, error = %error, "campaign failed");
        Self {
            campaign_id,
            status: CampaignTaskStatus::Failed { phase, error },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, CampaignTaskStatus::Failed { .. })
    }
}

/// Applies retention to one campaign (`only`) or to every campaign.
/// In a multi-campaign run a failing campaign is recorded and the rest still run.
pub async fn prune_campaigns(
    ctx: &RunContext,
    only: Option<&str>,
    dry_run: bool,
) -> Result<Vec<CampaignTaskRecord<PruneReport>>> {
    let dirs = match only {
        Some(id) => vec![find_campaign(ctx, id)?.base_path],
        None => campaign_dirs(&ctx.config.campaigns_dir)?,
    };

    let mut records = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let campaign = match Campaign::from_path(&dir, &ctx.registry) {
            Ok(campaign) => campaign,
            Err(err) => {
                records.push(CampaignTaskRecord::failed(dir_label(&dir), UpdatePhase::LoadConfig, &err));
                continue;
            }
        };
        let record = match campaign.prune(dry_run).await {
            Ok(report) => CampaignTaskRecord {
                campaign_id: campaign.id.clone(),
                status: CampaignTaskStatus::Done(report),
            },
            Err(err) => CampaignTaskRecord::failed(campaign.id.clone(), UpdatePhase::Prune, &err),
        };
        records.push(record);
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct RenderSummary {
    /// `Done(true)` when a page was written, `Done(false)` when there is no snapshot yet.
    pub campaigns: Vec<CampaignTaskRecord<bool>>,
    pub index_rendered: bool,
}

impl RenderSummary {
    pub fn rendered(&self) -> usize {
        self.campaigns
            .iter()
            .filter(|c| matches!(c.status, CampaignTaskStatus::Done(true)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.campaigns.iter().filter(|c| c.is_failed()).count()
    }
}

/// Re-renders pages from saved snapshots. The index is written only for full runs.
pub async fn render_campaigns(ctx: &RunContext, only: Option<&str>) -> Result<RenderSummary> {
    let dirs = match only {
        Some(id) => vec![find_campaign(ctx, id)?.base_path],
        None => campaign_dirs(&ctx.config.campaigns_dir)?,
    };

    let mut records = Vec::with_capacity(dirs.len());
    let mut summaries = Vec::new();
    for dir in dirs {
        let mut campaign = match Campaign::from_path(&dir, &ctx.registry) {
            Ok(campaign) => campaign,
            Err(err) => {
                records.push(CampaignTaskRecord::failed(dir_label(&dir), UpdatePhase::LoadConfig, &err));
                continue;
            }
        };
        let loaded = campaign.load_latest_state().await.map(|latest| latest.is_some());
        let status = match loaded {
            Err(err) => Err((UpdatePhase::LoadLatest, err)),
            Ok(false) => {
                warn!(campaign = %campaign.id, "no snapshot yet; nothing to render");
                Ok(false)
            }
            Ok(true) => campaign
                .render(ctx)
                .await
                .map(|()| true)
                .map_err(|err| (UpdatePhase::Render, err)),
        };
        records.push(match status {
            Ok(rendered) => CampaignTaskRecord {
                campaign_id: campaign.id.clone(),
                status: CampaignTaskStatus::Done(rendered),
            },
            Err((phase, err)) => CampaignTaskRecord::failed(campaign.id.clone(), phase, &err),
        });
        summaries.push(campaign.summary());
    }

    let index_rendered = match only {
        Some(_) => false,
        None => match ctx.renderer().render_index(&summaries) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "rendering campaign index failed");
                false
            }
        },
    };
    Ok(RenderSummary {
        campaigns: records,
        index_rendered,
    })
}

/// Cron-driven `update_all` runs, each under its own run id.
pub async fn maybe_build_scheduler(ctx: &RunContext) -> Result<Option<JobScheduler>> {
    if !ctx.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = ctx.config.update_cron.clone();
    let base = ctx.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let ctx = base.next_run();
        Box::pin(async move {
            match update_all(&ctx, false).await {
                Ok(summary) => info!(run_id = %summary.run_id, failed = summary.failed(), "scheduled update finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled update failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
