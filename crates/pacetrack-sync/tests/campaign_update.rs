use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pacetrack_storage::{SnapshotError, SnapshotKind};
use pacetrack_sync::{
    prune_campaigns, render_campaigns, update_all, update_one, Campaign, CampaignReport,
    CampaignRunStatus, CampaignState, CampaignSummary, CampaignTaskStatus, GoalDelta,
    PacetrackConfig, ReportRenderer, RunContext, StateError, UpdateOutcome, UpdatePhase,
};
use tempfile::{tempdir, TempDir};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("ts")
        .with_timezone(&Utc)
}

fn copy_example_campaign(campaigns: &Path, name: &str, extra_config: &str) -> PathBuf {
    let src = workspace_root().join("campaigns/example_campaign");
    let dst = campaigns.join(name);
    std::fs::create_dir_all(&dst).expect("mkdir");
    let config = std::fs::read_to_string(src.join("config.yaml")).expect("config");
    std::fs::write(dst.join("config.yaml"), format!("{config}{extra_config}")).expect("write config");
    std::fs::copy(src.join("articles.json"), dst.join("articles.json")).expect("copy articles");
    dst
}

fn context(campaigns: &Path, renderer: Arc<RecordingRenderer>) -> RunContext {
    let config = PacetrackConfig {
        campaigns_dir: campaigns.to_path_buf(),
        static_dir: campaigns.join("static"),
        api_fixture: Some(workspace_root().join("fixtures/reference_api/example.json")),
        item_concurrency: 2,
        ..PacetrackConfig::default()
    };
    RunContext::new(config).expect("context").with_renderer(renderer)
}

#[derive(Default)]
struct RecordingRenderer {
    campaigns: Mutex<Vec<(String, Vec<GoalDelta>)>>,
    index_sizes: Mutex<Vec<usize>>,
}

impl ReportRenderer for RecordingRenderer {
    fn render_campaign(&self, report: &CampaignReport<'_>) -> Result<()> {
        self.campaigns
            .lock()
            .expect("lock")
            .push((report.summary.id.clone(), report.deltas.clone()));
        Ok(())
    }

    fn render_index(&self, campaigns: &[CampaignSummary]) -> Result<()> {
        self.index_sizes.lock().expect("lock").push(campaigns.len());
        Ok(())
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn break_goal_metric(dir: &Path) {
    let config = std::fs::read_to_string(dir.join("config.yaml"))
        .expect("config")
        .replace("metric: ref_count", "metric: page_views");
    std::fs::write(dir.join("config.yaml"), config).expect("write config");
}

fn setup() -> (TempDir, PathBuf) {
    let dir = tempdir().expect("tempdir");
    let campaigns = dir.path().join("campaigns");
    std::fs::create_dir_all(&campaigns).expect("campaigns dir");
    (dir, campaigns)
}

#[tokio::test]
async fn update_all_updates_skips_and_isolates_failures() {
    let (_guard, campaigns) = setup();
    let broken = copy_example_campaign(&campaigns, "a_broken", "");
    break_goal_metric(&broken);
    let example = copy_example_campaign(&campaigns, "example_campaign", "");
    copy_example_campaign(&campaigns, "z_disabled", "disabled: true\n");

    let renderer = Arc::new(RecordingRenderer::default());
    let ctx = context(&campaigns, renderer.clone());

    let first = update_all(&ctx, false).await.expect("first run");
    let statuses = first
        .campaigns
        .iter()
        .map(|c| (c.campaign_id.as_str(), &c.status))
        .collect::<Vec<_>>();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses[0].0, "a_broken");
    assert!(matches!(
        statuses[0].1,
        CampaignRunStatus::Failed { phase: UpdatePhase::LoadConfig, .. }
    ));
    assert_eq!(statuses[1].0, "example_campaign");
    assert!(matches!(statuses[1].1, CampaignRunStatus::Updated { rendered: true, .. }));
    assert_eq!(statuses[2], ("z_disabled", &CampaignRunStatus::Disabled));
    assert_eq!(first.failed(), 1);
    assert!(first.index_rendered);
    assert_eq!(*renderer.index_sizes.lock().unwrap(), vec![2]);

    let data = example.join("data");
    assert_eq!(
        files_in(&data.join("202401")),
        vec!["state_20240101_000000.json", "state_full_20240101_000000.json.gz"]
    );
    let latest_bucket = pacetrack_storage::SnapshotStore::bucket_name(Utc::now());
    assert_eq!(files_in(&data.join(&latest_bucket)).len(), 2);
    assert!(files_in(&campaigns.join("z_disabled")).iter().all(|f| f != "data"));

    let rendered = renderer.campaigns.lock().unwrap().clone();
    assert_eq!(rendered.len(), 1);
    let deltas = &rendered[0].1;
    let exists = deltas.iter().find(|d| d.key == "article_exists").expect("exists goal");
    assert_eq!((exists.start_done_count, exists.latest_done_count), (2, 3));
    let project = deltas
        .iter()
        .find(|d| d.key == "tagged_by_wikiproject_food_and_drink")
        .expect("project goal");
    assert_eq!(project.done_change, 0);

    let second = update_all(&ctx.next_run(), false).await.expect("second run");
    assert!(matches!(second.campaigns[1].status, CampaignRunStatus::Skipped { .. }));
    assert_eq!(files_in(&data.join(&latest_bucket)).len(), 2);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let forced = update_all(&ctx.next_run(), true).await.expect("forced run");
    assert!(matches!(forced.campaigns[1].status, CampaignRunStatus::Updated { .. }));
    assert_eq!(files_in(&data.join(&latest_bucket)).len(), 4);
}

#[tokio::test]
async fn live_state_aggregates_in_item_order_and_round_trips() {
    let (_guard, campaigns) = setup();
    let dir = copy_example_campaign(&campaigns, "example_campaign", "");
    let ctx = context(&campaigns, Arc::new(RecordingRenderer::default()));

    let mut campaign = Campaign::from_path(&dir, &ctx.registry).expect("campaign");
    campaign.load_items().expect("items");
    let ts = at("2026-03-01T12:00:00Z");
    let mut state = CampaignState::from_live_fetch(&ctx, &campaign, ts).await.expect("live fetch");

    assert_eq!(state.titles, vec!["Coffee", "Tea", "Espresso", "Yerba mate"]);
    let items = state.item_results.as_ref().expect("items");
    assert_eq!(
        items.iter().map(|r| r.title()).collect::<Vec<_>>(),
        vec!["Coffee", "Tea", "Espresso", "Yerba mate"]
    );
    let yerba = &items[3];
    assert!(!yerba.features.exists());
    assert!(yerba.features.templates.is_empty());
    assert!(!yerba.results["article_exists"].done);

    let refs = state.goal_result("at_least_5_references").expect("refs goal");
    assert_eq!((refs.done_count, refs.not_done_count, refs.total_count), (2, 2, 4));
    assert_eq!(refs.ratio, 0.5);
    assert!(!refs.done);
    let infobox = state.goal_result("has_infobox").expect("infobox goal");
    assert!(infobox.done);
    let rollup = state.campaign_results.expect("rollup");
    assert_eq!((rollup.goals_done, rollup.goals_total), (1, 6));
    assert_eq!(rollup.done_count + rollup.not_done_count, rollup.total_count);

    let store = campaign.snapshot_store();
    let written = state.save(&store).await.expect("save");
    assert!(state.save_date.is_some());

    let light = CampaignState::from_json_path(&written.light).await.expect("light");
    assert_eq!(light.timestamp, ts);
    assert_eq!(light.goal_results, state.goal_results);
    assert!(light.item_results.is_none());

    let full = CampaignState::from_json_path(&written.full).await.expect("full");
    assert_eq!(full, state);

    let latest = CampaignState::from_latest(&store, SnapshotKind::Full).await.expect("latest");
    assert_eq!(latest.timestamp, ts);

    let collision = state.save(&store).await.expect_err("same second");
    assert!(matches!(collision, StateError::Snapshot(SnapshotError::Collision(_))));
}

#[tokio::test]
async fn start_state_is_backfilled_once() {
    let (_guard, campaigns) = setup();
    let dir = copy_example_campaign(&campaigns, "example_campaign", "");
    let ctx = context(&campaigns, Arc::new(RecordingRenderer::default()));

    let mut campaign = Campaign::from_path(&dir, &ctx.registry).expect("campaign");
    let start = campaign.resolve_start_state(&ctx).await.expect("backfill").clone();
    assert_eq!(start.timestamp, at("2024-01-01T00:00:00Z"));
    let exists = start.goal_result("article_exists").expect("goal");
    assert_eq!(exists.done_count, 2);

    let start_bucket = dir.join("data/202401");
    assert_eq!(files_in(&start_bucket).len(), 2);

    let mut reloaded = Campaign::from_path(&dir, &ctx.registry).expect("campaign");
    let again = reloaded.resolve_start_state(&ctx).await.expect("from disk");
    assert_eq!(again.goal_results, start.goal_results);
    assert_eq!(files_in(&start_bucket).len(), 2);
}

#[tokio::test]
async fn future_start_date_compares_against_latest() {
    let (_guard, campaigns) = setup();
    let dir = copy_example_campaign(&campaigns, "example_campaign", "");
    let config = std::fs::read_to_string(dir.join("config.yaml"))
        .unwrap()
        .replace("campaign_start_date: 2024-01-01", "campaign_start_date: 2099-01-01");
    std::fs::write(dir.join("config.yaml"), config).unwrap();

    let renderer = Arc::new(RecordingRenderer::default());
    let ctx = context(&campaigns, renderer.clone());
    let mut campaign = Campaign::from_path(&dir, &ctx.registry).expect("campaign");

    let outcome = campaign.update(&ctx, false).await.expect("update");
    assert!(matches!(outcome, UpdateOutcome::Updated { rendered: true, .. }));
    assert_eq!(campaign.start_state(), campaign.latest_state());
    assert!(files_in(&dir.join("data/209901")).is_empty());

    let rendered = renderer.campaigns.lock().unwrap().clone();
    assert!(rendered[0].1.iter().all(|d| d.done_change == 0));
}

#[tokio::test]
async fn prune_and_render_continue_past_a_broken_campaign() {
    let (_guard, campaigns) = setup();
    let broken = copy_example_campaign(&campaigns, "a_broken", "");
    break_goal_metric(&broken);
    copy_example_campaign(&campaigns, "good", "");
    let fresh = copy_example_campaign(&campaigns, "m_fresh", "");

    let renderer = Arc::new(RecordingRenderer::default());
    let ctx = context(&campaigns, renderer.clone());
    let outcome = update_one(&ctx, "good", false).await.expect("update good");
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));

    let pruned = prune_campaigns(&ctx, None, true).await.expect("prune run");
    let ids = pruned.iter().map(|r| r.campaign_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["a_broken", "good", "m_fresh"]);
    match &pruned[0].status {
        CampaignTaskStatus::Failed { phase, error } => {
            assert_eq!(*phase, UpdatePhase::LoadConfig);
            assert!(error.contains("page_views"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    match &pruned[1].status {
        CampaignTaskStatus::Done(report) => {
            assert!(report.dry_run);
            assert_eq!(report.pruned_count(), 0);
            assert_eq!(report.kept_count(), 2);
        }
        other => panic!("expected prune report, got {other:?}"),
    }
    assert!(matches!(&pruned[2].status, CampaignTaskStatus::Done(report) if report.bucket.is_none()));

    let rendered = render_campaigns(&ctx, None).await.expect("render run");
    assert_eq!(rendered.failed(), 1);
    assert_eq!(rendered.rendered(), 1);
    assert!(matches!(rendered.campaigns[2].status, CampaignTaskStatus::Done(false)));
    assert!(rendered.index_rendered);
    assert_eq!(renderer.index_sizes.lock().unwrap().last(), Some(&2));
    assert!(files_in(&fresh).iter().all(|f| f != "data"));
}

#[tokio::test]
async fn explicit_update_of_disabled_campaign_does_nothing() {
    let (_guard, campaigns) = setup();
    let dir = copy_example_campaign(&campaigns, "paused", "disabled: true\n");
    let ctx = context(&campaigns, Arc::new(RecordingRenderer::default()));

    let outcome = update_one(&ctx, "paused", true).await.expect("update");
    assert_eq!(outcome, UpdateOutcome::Disabled);
    assert!(files_in(&dir).iter().all(|f| f != "data"));
}
