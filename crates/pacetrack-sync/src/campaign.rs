use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use pacetrack_adapters::{ItemListConfig, ItemListSource};
use pacetrack_core::{validate_campaign_id, Frequency, Goal, GoalSet, MetricRegistry};
use pacetrack_storage::{PruneReport, SnapshotKind, SnapshotStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::state::{goal_deltas, CampaignState};
use crate::{CampaignReport, CampaignSummary, RunContext};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

fn default_lang() -> String {
    "en".to_string()
}

fn default_fetch_frequency() -> Frequency {
    Frequency::from_secs(3_600)
}

fn default_save_frequency() -> Frequency {
    Frequency::from_secs(86_400)
}

/// `campaigns/<id>/config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub wikiproject_name: Option<String>,
    pub campaign_start_date: NaiveDate,
    #[serde(default)]
    pub campaign_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub date_created: Option<NaiveDate>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub article_list: ItemListConfig,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_fetch_frequency")]
    pub fetch_frequency: Frequency,
    #[serde(default = "default_save_frequency")]
    pub save_frequency: Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    LoadConfig,
    LoadItems,
    LoadLatest,
    Fetch,
    Save,
    Reload,
    Prune,
    StartState,
    Render,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadConfig => "load_config",
            Self::LoadItems => "load_items",
            Self::LoadLatest => "load_latest",
            Self::Fetch => "fetch",
            Self::Save => "save",
            Self::Reload => "reload",
            Self::Prune => "prune",
            Self::StartState => "start_state",
            Self::Render => "render",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("campaign {campaign} failed during {phase}: {source:#}")]
pub struct UpdateError {
    pub campaign: String,
    pub phase: UpdatePhase,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// `disabled: true` in the campaign config; nothing fetched or saved.
    Disabled,
    /// Latest snapshot is still fresh.
    Skipped { next_due: DateTime<Utc> },
    Updated {
        timestamp: DateTime<Utc>,
        items: usize,
        goals_done: usize,
        goals_total: usize,
        pruned: usize,
        rendered: bool,
    },
}

pub struct Campaign {
    pub id: String,
    pub base_path: PathBuf,
    pub config: CampaignConfig,
    goals: GoalSet,
    item_source: ItemListSource,
    items: Vec<String>,
    start_state: Option<CampaignState>,
    latest_state: Option<CampaignState>,
}

impl fmt::Debug for Campaign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Campaign")
            .field("id", &self.id)
            .field("base_path", &self.base_path)
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl Campaign {
    /// Loads and validates `<dir>/config.yaml`. The item list is read separately by `load_items`.
    pub fn from_path(dir: &Path, registry: &MetricRegistry) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: CampaignConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", config_path.display()))?;

        let id = match &config.id {
            Some(id) => id.clone(),
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("campaign directory {} has no name", dir.display()))?,
        };
        validate_campaign_id(&id)?;
        let goals = GoalSet::new(config.goals.clone(), registry)
            .with_context(|| format!("validating goals for campaign {id}"))?;
        let item_source = ItemListSource::try_from(&config.article_list)
            .with_context(|| format!("resolving item list for campaign {id}"))?;

        Ok(Self {
            id,
            base_path: dir.to_path_buf(),
            config,
            goals,
            item_source,
            items: Vec::new(),
            start_state: None,
            latest_state: None,
        })
    }

    pub fn goals(&self) -> &GoalSet {
        &self.goals
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_disabled(&self) -> bool {
        self.config.disabled
    }

    pub fn load_items(&mut self) -> Result<&[String]> {
        self.items = self
            .item_source
            .load(&self.base_path)
            .with_context(|| format!("loading item list for campaign {}", self.id))?;
        Ok(&self.items)
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.base_path.join("data"))
    }

    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.config
            .campaign_start_date
            .and_time(NaiveTime::MIN)
            .and_utc()
    }

    pub fn latest_state(&self) -> Option<&CampaignState> {
        self.latest_state.as_ref()
    }

    pub fn start_state(&self) -> Option<&CampaignState> {
        self.start_state.as_ref()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.latest_state
            .as_ref()
            .map(|s| s.timestamp + self.config.fetch_frequency.as_time_delta())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due().map_or(true, |due| now >= due)
    }

    /// Reloads the newest full snapshot; `None` before the first save.
    pub async fn load_latest_state(&mut self) -> Result<Option<&CampaignState>> {
        self.latest_state = match CampaignState::from_latest(&self.snapshot_store(), SnapshotKind::Full).await {
            Ok(state) => Some(state),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("loading latest state for campaign {}", self.id))
            }
        };
        Ok(self.latest_state.as_ref())
    }

    /// Snapshot from the campaign start day, backfilled with a live fetch when none exists.
    /// A start date in the future has nothing to compare against, so the latest state stands in.
    pub async fn resolve_start_state(&mut self, ctx: &RunContext) -> Result<&CampaignState> {
        if self.start_state.is_none() {
            let start = self.start_timestamp();
            let state = if start > Utc::now() {
                self.latest_state
                    .clone()
                    .with_context(|| format!("campaign {} starts in the future and has no snapshot yet", self.id))?
            } else {
                let store = self.snapshot_store();
                match CampaignState::from_timestamp(&store, start, SnapshotKind::Light).await {
                    Ok(state) => state,
                    Err(err) if err.is_not_found() => {
                        info!(campaign = %self.id, %start, "no start snapshot; backfilling");
                        if self.items.is_empty() {
                            self.load_items()?;
                        }
                        let mut state = CampaignState::from_live_fetch(ctx, self, start).await?;
                        state
                            .save(&store)
                            .await
                            .with_context(|| format!("saving backfilled start state for {}", self.id))?;
                        state
                    }
                    Err(err) => return Err(err).context("loading start state"),
                }
            };
            self.start_state = Some(state);
        }
        self.start_state
            .as_ref()
            .context("start state unavailable")
    }

    pub async fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        self.snapshot_store()
            .prune(self.config.save_frequency.as_time_delta(), dry_run)
            .await
            .with_context(|| format!("pruning snapshots for campaign {}", self.id))
    }

    pub fn summary(&self) -> CampaignSummary {
        let latest = self.latest_state.as_ref();
        CampaignSummary {
            id: self.id.clone(),
            name: self.config.name.clone(),
            lang: self.config.lang.clone(),
            disabled: self.config.disabled,
            campaign_start_date: self.config.campaign_start_date,
            campaign_end_date: self.config.campaign_end_date,
            latest_timestamp: latest.map(|s| s.timestamp),
            results: latest.map(CampaignState::rollup),
        }
    }

    /// Hands the start and latest states to the configured renderer.
    pub async fn render(&mut self, ctx: &RunContext) -> Result<()> {
        if self.latest_state.is_none() {
            self.load_latest_state().await?;
        }
        self.resolve_start_state(ctx).await?;
        let (Some(start), Some(latest)) = (&self.start_state, &self.latest_state) else {
            anyhow::bail!("campaign {} has no saved state to render", self.id);
        };
        let report = CampaignReport {
            summary: self.summary(),
            config: &self.config,
            deltas: goal_deltas(start, latest),
            start_state: start,
            latest_state: latest,
        };
        ctx.renderer()
            .render_campaign(&report)
            .with_context(|| format!("rendering campaign {}", self.id))
    }

    /// One update cycle: fetch when due, persist, reload, prune, then render.
    pub async fn update(&mut self, ctx: &RunContext, force: bool) -> Result<UpdateOutcome, UpdateError> {
        let span = info_span!("campaign_update", campaign = %self.id, run_id = %ctx.run_id);
        self.update_inner(ctx, force).instrument(span).await
    }

    async fn update_inner(&mut self, ctx: &RunContext, force: bool) -> Result<UpdateOutcome, UpdateError> {
        if self.is_disabled() {
            info!("campaign disabled; skipping");
            return Ok(UpdateOutcome::Disabled);
        }

        let id = self.id.clone();
        let fail = |phase: UpdatePhase| {
            let campaign = id.clone();
            move |source: anyhow::Error| UpdateError {
                campaign,
                phase,
                source,
            }
        };

        self.load_items().map_err(fail(UpdatePhase::LoadItems))?;
        self.load_latest_state().await.map_err(fail(UpdatePhase::LoadLatest))?;

        let now = Utc::now();
        if !force && !self.is_due(now) {
            let next_due = self.next_due().unwrap_or(now);
            info!(%next_due, "campaign not due; skipping fetch");
            return Ok(UpdateOutcome::Skipped { next_due });
        }

        let mut state = CampaignState::from_live_fetch(ctx, self, now)
            .await
            .map_err(fail(UpdatePhase::Fetch))?;
        let store = self.snapshot_store();
        state
            .save(&store)
            .await
            .map_err(|e| fail(UpdatePhase::Save)(e.into()))?;

        let latest = self
            .load_latest_state()
            .await
            .map_err(fail(UpdatePhase::Reload))?
            .cloned()
            .ok_or_else(|| fail(UpdatePhase::Reload)(anyhow::anyhow!("saved state not found on reload")))?;

        let pruned = self.prune(false).await.map_err(fail(UpdatePhase::Prune))?;
        self.resolve_start_state(ctx)
            .await
            .map_err(fail(UpdatePhase::StartState))?;

        let rendered = match self.render(ctx).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "rendering failed; snapshots are unaffected");
                false
            }
        };

        let rollup = latest.rollup();
        info!(
            timestamp = %latest.timestamp,
            items = latest.titles.len(),
            goals_done = rollup.goals_done,
            goals_total = rollup.goals_total,
            pruned = pruned.pruned_count(),
            rendered,
            "campaign updated"
        );
        Ok(UpdateOutcome::Updated {
            timestamp: latest.timestamp,
            items: latest.titles.len(),
            goals_done: rollup.goals_done,
            goals_total: rollup.goals_total,
            pruned: pruned.pruned_count(),
            rendered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_campaign(root: &Path, dir: &str, config: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).expect("mkdir");
        std::fs::write(path.join(CONFIG_FILE_NAME), config).expect("config");
        std::fs::write(path.join("articles.json"), r#"[{"article": "Coffee"}]"#).expect("articles");
        path
    }

    const MINIMAL: &str = r#"
name: Demo
campaign_start_date: 2026-01-01
article_list:
  type: sparql_json_file
  path: articles.json
  title_key: article
goals:
  - name: Has article
    metric: article_exists
    cmp: bool
"#;

    #[test]
    fn config_defaults_and_directory_id() {
        let dir = tempdir().expect("tempdir");
        let path = write_campaign(dir.path(), "demo_campaign", MINIMAL);
        let campaign = Campaign::from_path(&path, &MetricRegistry::with_builtins()).expect("campaign");

        assert_eq!(campaign.id, "demo_campaign");
        assert_eq!(campaign.config.lang, "en");
        assert_eq!(campaign.config.fetch_frequency, Frequency::from_secs(3_600));
        assert_eq!(campaign.config.save_frequency, Frequency::from_secs(86_400));
        assert_eq!(campaign.goals().len(), 1);
        assert!(campaign.is_due(Utc::now()));
        assert_eq!(campaign.start_timestamp().to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn invalid_ids_sources_and_metrics_fail_at_load() {
        let dir = tempdir().expect("tempdir");
        let registry = MetricRegistry::with_builtins();

        let bad_dir = write_campaign(dir.path(), "Bad-Name", MINIMAL);
        let err = Campaign::from_path(&bad_dir, &registry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<pacetrack_core::ConfigError>(),
            Some(pacetrack_core::ConfigError::InvalidCampaignId(_))
        ));

        let petscan = MINIMAL.replace("sparql_json_file", "petscan");
        let path = write_campaign(dir.path(), "petscan_campaign", &petscan);
        let err = Campaign::from_path(&path, &registry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<pacetrack_core::ConfigError>(),
            Some(pacetrack_core::ConfigError::UnsupportedItemSource(_))
        ));

        let unknown = MINIMAL.replace("article_exists", "page_views");
        let path = write_campaign(dir.path(), "unknown_metric", &unknown);
        let err = Campaign::from_path(&path, &registry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<pacetrack_core::ConfigError>(),
            Some(pacetrack_core::ConfigError::UnknownMetric { .. })
        ));
    }

    #[test]
    fn frequencies_parse_from_human_strings() {
        let dir = tempdir().expect("tempdir");
        let config = format!("{MINIMAL}fetch_frequency: 30m\nsave_frequency: 7200\n");
        let path = write_campaign(dir.path(), "cadence", &config);
        let campaign = Campaign::from_path(&path, &MetricRegistry::with_builtins()).expect("campaign");
        assert_eq!(campaign.config.fetch_frequency, Frequency::from_secs(1_800));
        assert_eq!(campaign.config.save_frequency, Frequency::from_secs(7_200));
    }
}
