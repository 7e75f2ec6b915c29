use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use pacetrack_adapters::fetch_item_features;
use pacetrack_core::{
    aggregate_goal_results, CampaignGoalResult, CampaignResults, GoalResult, ItemFeatures,
};
use pacetrack_storage::{SnapshotError, SnapshotKind, SnapshotStore, WrittenPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::campaign::Campaign;
use crate::RunContext;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("refusing to save campaign state for {campaign}: {missing} not populated")]
    NotPopulated {
        campaign: String,
        missing: &'static str,
    },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("encoding campaign state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Snapshot(err) if err.is_not_found())
    }
}

/// One item's fetched features and its per-goal results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub features: ItemFeatures,
    pub results: BTreeMap<String, GoalResult>,
}

impl ItemRecord {
    pub fn title(&self) -> &str {
        &self.features.title
    }
}

/// Point-in-time campaign progress, as computed live or loaded from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignState {
    pub campaign_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub save_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub campaign_results: Option<CampaignResults>,
    #[serde(default)]
    pub goal_results: Vec<CampaignGoalResult>,
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_results: Option<Vec<ItemRecord>>,
}

impl CampaignState {
    /// Fetches every item as of `timestamp`, evaluates the campaign's goals and aggregates.
    ///
    /// Items are fetched concurrently but results keep item-list order.
    pub async fn from_live_fetch(
        ctx: &RunContext,
        campaign: &Campaign,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let timestamp = timestamp.trunc_subsecs(0);
        let titles = campaign.items().to_vec();
        let total = titles.len();
        let api = ctx.api_for(&campaign.config.lang);
        let policy = ctx.fetch_policy();
        let limit = Arc::new(Semaphore::new(ctx.config.item_concurrency.max(1)));

        info!(campaign = %campaign.id, items = total, %timestamp, "fetching item features");

        let mut tasks = JoinSet::new();
        for (idx, title) in titles.iter().cloned().enumerate() {
            let api = api.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let features = fetch_item_features(api, &title, timestamp, policy).await;
                (idx, features)
            });
        }

        let mut slots: Vec<Option<ItemFeatures>> = vec![None; total];
        let mut completed = 0usize;
        let step = (total / 10).max(1);
        while let Some(joined) = tasks.join_next().await {
            let (idx, features) = joined.context("item fetch task failed")?;
            completed += 1;
            debug!(campaign = %campaign.id, title = %features.title, completed, total, "item fetched");
            if completed % step == 0 || completed == total {
                info!(campaign = %campaign.id, completed, total, "fetch progress");
            }
            slots[idx] = Some(features);
        }

        let mut records = Vec::with_capacity(total);
        for (idx, slot) in slots.into_iter().enumerate() {
            let features = slot.with_context(|| format!("no features for item #{idx}"))?;
            let results = campaign
                .goals()
                .evaluate(&features, &ctx.registry)
                .with_context(|| format!("evaluating goals for {}", features.title))?;
            records.push(ItemRecord { features, results });
        }

        let goal_results = aggregate_goal_results(campaign.goals(), records.iter().map(|r| &r.results));
        let campaign_results = CampaignResults::from_goal_results(&goal_results);

        Ok(Self {
            campaign_id: campaign.id.clone(),
            timestamp,
            save_date: None,
            campaign_results: Some(campaign_results),
            goal_results,
            titles,
            item_results: Some(records),
        })
    }

    pub fn is_populated(&self) -> bool {
        self.campaign_results.is_some() && self.item_results.is_some()
    }

    /// Persists the full then light variant under the logical timestamp.
    pub async fn save(&mut self, store: &SnapshotStore) -> Result<WrittenPair, StateError> {
        if self.item_results.is_none() {
            return Err(StateError::NotPopulated {
                campaign: self.campaign_id.clone(),
                missing: "item_results",
            });
        }
        if self.campaign_results.is_none() {
            return Err(StateError::NotPopulated {
                campaign: self.campaign_id.clone(),
                missing: "campaign_results",
            });
        }

        self.save_date = Some(Utc::now().trunc_subsecs(0));
        let full = serde_json::to_value(&*self)?;
        let mut light = full.clone();
        if let Some(doc) = light.as_object_mut() {
            doc.remove("item_results");
        }

        let written = store
            .write_pair(
                self.timestamp,
                &serde_json::to_vec_pretty(&light)?,
                &serde_json::to_vec(&full)?,
            )
            .await?;
        info!(campaign = %self.campaign_id, timestamp = %self.timestamp, path = %written.light.display(), "campaign state saved");
        Ok(written)
    }

    pub async fn from_json_path(path: &Path) -> Result<Self, StateError> {
        let mut state: Self = SnapshotStore::read_document(path).await?;
        if state.campaign_results.is_none() {
            warn!(path = %path.display(), "snapshot lacks campaign_results; recomputing from goal results");
            state.campaign_results = Some(CampaignResults::from_goal_results(&state.goal_results));
        }
        Ok(state)
    }

    pub async fn from_latest(store: &SnapshotStore, kind: SnapshotKind) -> Result<Self, StateError> {
        let file = store.latest(kind).await?;
        Self::from_json_path(&file.path).await
    }

    /// First snapshot saved on the same day as `timestamp`.
    pub async fn from_timestamp(
        store: &SnapshotStore,
        timestamp: DateTime<Utc>,
        kind: SnapshotKind,
    ) -> Result<Self, StateError> {
        let file = store.find_on_day(kind, timestamp).await?;
        Self::from_json_path(&file.path).await
    }

    pub fn goal_result(&self, key: &str) -> Option<&CampaignGoalResult> {
        self.goal_results.iter().find(|g| g.key == key)
    }

    pub fn rollup(&self) -> CampaignResults {
        self.campaign_results
            .unwrap_or_else(|| CampaignResults::from_goal_results(&self.goal_results))
    }
}

/// Change of one goal between the start state and the latest state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalDelta {
    pub key: String,
    pub name: String,
    pub start_ratio: f64,
    pub latest_ratio: f64,
    pub ratio_change: f64,
    pub start_done_count: usize,
    pub latest_done_count: usize,
    pub done_change: i64,
    pub done: bool,
}

/// Per-goal change, in the latest state's goal order. Goals absent at the start count from zero.
pub fn goal_deltas(start: &CampaignState, latest: &CampaignState) -> Vec<GoalDelta> {
    latest
        .goal_results
        .iter()
        .map(|now| {
            let (start_ratio, start_done_count) = start
                .goal_result(&now.key)
                .map(|g| (g.ratio, g.done_count))
                .unwrap_or((0.0, 0));
            GoalDelta {
                key: now.key.clone(),
                name: now.name.clone(),
                start_ratio,
                latest_ratio: now.ratio,
                ratio_change: now.ratio - start_ratio,
                start_done_count,
                latest_done_count: now.done_count,
                done_change: now.done_count as i64 - start_done_count as i64,
                done: now.done,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn goal_result(key: &str, done: usize, total: usize) -> CampaignGoalResult {
        CampaignGoalResult::from_counts(key, key.to_uppercase(), done, total, 0.5)
    }

    fn light_state(ts: &str, goal_results: Vec<CampaignGoalResult>) -> CampaignState {
        CampaignState {
            campaign_id: "demo".into(),
            timestamp: DateTime::parse_from_rfc3339(ts).expect("ts").with_timezone(&Utc),
            save_date: None,
            campaign_results: Some(CampaignResults::from_goal_results(&goal_results)),
            goal_results,
            titles: vec!["Coffee".into(), "Tea".into()],
            item_results: None,
        }
    }

    #[tokio::test]
    async fn save_refuses_unpopulated_state() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let mut state = light_state("2026-03-01T00:00:00Z", vec![goal_result("refs", 1, 2)]);

        let err = state.save(&store).await.expect_err("no item results");
        assert!(matches!(err, StateError::NotPopulated { missing: "item_results", .. }));
        assert!(store.list_buckets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_snapshot_without_rollup_is_recomputed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state_20180101_000000.json");
        std::fs::write(
            &path,
            r#"{
                "campaign_id": "demo",
                "timestamp": "2018-01-01T00:00:00Z",
                "goal_results": [{
                    "key": "refs", "name": "Refs", "done_count": 3, "not_done_count": 1,
                    "total_count": 4, "ratio": 0.75, "target_ratio": 0.5, "done": true, "progress": 1.5
                }]
            }"#,
        )
        .expect("write legacy");

        let state = CampaignState::from_json_path(&path).await.expect("load");
        let rollup = state.campaign_results.expect("recomputed");
        assert_eq!((rollup.done_count, rollup.total_count, rollup.goals_done), (3, 4, 1));
        assert!(state.titles.is_empty());
        assert!(state.item_results.is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_is_distinct_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let ts = DateTime::parse_from_rfc3339("2026-03-04T00:00:00Z").unwrap().with_timezone(&Utc);

        let err = CampaignState::from_timestamp(&store, ts, SnapshotKind::Light)
            .await
            .expect_err("nothing saved");
        assert!(err.is_not_found());

        std::fs::create_dir_all(dir.path().join("202603")).unwrap();
        std::fs::write(dir.path().join("202603/state_20260301_000000.json"), "{}").unwrap();
        let err = CampaignState::from_timestamp(&store, ts, SnapshotKind::Light)
            .await
            .expect_err("different day");
        assert!(err.is_not_found());

        let malformed = CampaignState::from_latest(&store, SnapshotKind::Light)
            .await
            .expect_err("malformed json");
        assert!(!malformed.is_not_found());
    }

    #[test]
    fn deltas_follow_latest_goal_order() {
        let start = light_state("2026-01-01T00:00:00Z", vec![goal_result("refs", 1, 4)]);
        let latest = light_state(
            "2026-03-01T00:00:00Z",
            vec![goal_result("exists", 4, 4), goal_result("refs", 3, 4)],
        );

        let deltas = goal_deltas(&start, &latest);
        assert_eq!(deltas.iter().map(|d| d.key.as_str()).collect::<Vec<_>>(), vec!["exists", "refs"]);
        assert_eq!(deltas[0].start_done_count, 0);
        assert_eq!(deltas[0].done_change, 4);
        assert_eq!(deltas[1].done_change, 2);
        assert!((deltas[1].ratio_change - 0.5).abs() < 1e-12);
    }
}
