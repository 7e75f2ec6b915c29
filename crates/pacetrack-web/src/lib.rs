use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use pacetrack_core::{CampaignResults, GoalResult};
use pacetrack_sync::{CampaignReport, CampaignSummary, ReportRenderer};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pacetrack-web";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

#[derive(Debug, Clone)]
struct GoalRow {
    name: String,
    start: String,
    latest: String,
    change: String,
    done_counts: String,
    target: String,
    status: &'static str,
}

#[derive(Debug, Clone)]
struct ItemRow {
    title: String,
    missing: String,
    cells: Vec<&'static str>,
}

#[derive(Debug, Clone)]
struct CampaignRow {
    id: String,
    name: String,
    lang: String,
    dates: String,
    latest: String,
    goals: String,
    ratio: String,
}

#[derive(Template)]
#[template(path = "campaign.html")]
struct CampaignPageTemplate {
    name: String,
    description: String,
    lang: String,
    dates: String,
    start_timestamp: String,
    latest_timestamp: String,
    overall: String,
    goals: Vec<GoalRow>,
    goal_names: Vec<String>,
    items: Vec<ItemRow>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    generated_at: String,
    campaigns: Vec<CampaignRow>,
}

/// Writes campaign reports as static HTML under `output_dir`.
#[derive(Debug, Clone)]
pub struct StaticSiteRenderer {
    output_dir: PathBuf,
}

impl StaticSiteRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn campaign_page_path(&self, campaign_id: &str) -> PathBuf {
        self.output_dir
            .join("campaigns")
            .join(campaign_id)
            .join("index.html")
    }

    pub fn index_page_path(&self) -> PathBuf {
        self.output_dir.join("index.html")
    }
}

impl ReportRenderer for StaticSiteRenderer {
    fn render_campaign(&self, report: &CampaignReport<'_>) -> Result<()> {
        let page = campaign_page(report);
        let html = page
            .render()
            .with_context(|| format!("rendering campaign page for {}", report.summary.id))?;
        let path = self.campaign_page_path(&report.summary.id);
        write_page(&path, html.as_bytes())?;
        info!(campaign = %report.summary.id, path = %path.display(), "campaign page rendered");
        Ok(())
    }

    fn render_index(&self, campaigns: &[CampaignSummary]) -> Result<()> {
        let page = IndexTemplate {
            generated_at: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
            campaigns: campaigns
                .iter()
                .filter(|c| !c.disabled)
                .map(campaign_row)
                .collect(),
        };
        let html = page.render().context("rendering campaign index")?;
        let path = self.index_page_path();
        write_page(&path, html.as_bytes())?;
        info!(campaigns = page.campaigns.len(), path = %path.display(), "campaign index rendered");
        Ok(())
    }
}

fn campaign_page(report: &CampaignReport<'_>) -> CampaignPageTemplate {
    let summary = &report.summary;
    let goals = report
        .deltas
        .iter()
        .map(|delta| {
            let target_ratio = report
                .latest_state
                .goal_result(&delta.key)
                .map(|g| g.target_ratio)
                .unwrap_or(1.0);
            GoalRow {
                name: delta.name.clone(),
                start: percent(delta.start_ratio),
                latest: percent(delta.latest_ratio),
                change: signed_percent(delta.ratio_change),
                done_counts: format!("{} → {}", delta.start_done_count, delta.latest_done_count),
                target: percent(target_ratio),
                status: if delta.done { "done" } else { "in progress" },
            }
        })
        .collect::<Vec<_>>();

    let goal_keys = report
        .latest_state
        .goal_results
        .iter()
        .map(|g| g.key.as_str())
        .collect::<Vec<_>>();
    let items = report
        .latest_state
        .item_results
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|record| ItemRow {
            title: record.title().to_string(),
            missing: record.features.missing_features.join(", "),
            cells: goal_keys
                .iter()
                .map(|key| goal_cell(record.results.get(*key)))
                .collect(),
        })
        .collect();

    CampaignPageTemplate {
        name: summary.name.clone(),
        description: report.config.description.clone().unwrap_or_default(),
        lang: summary.lang.clone(),
        dates: date_range(summary),
        start_timestamp: format_timestamp(report.start_state.timestamp),
        latest_timestamp: format_timestamp(report.latest_state.timestamp),
        overall: overall(&report.latest_state.rollup()),
        goals,
        goal_names: report
            .latest_state
            .goal_results
            .iter()
            .map(|g| g.name.clone())
            .collect(),
        items,
    }
}

fn campaign_row(summary: &CampaignSummary) -> CampaignRow {
    let (goals, ratio) = match &summary.results {
        Some(results) => (
            format!("{}/{}", results.goals_done, results.goals_total),
            percent(results.ratio),
        ),
        None => ("-".to_string(), "-".to_string()),
    };
    CampaignRow {
        id: summary.id.clone(),
        name: summary.name.clone(),
        lang: summary.lang.clone(),
        dates: date_range(summary),
        latest: summary
            .latest_timestamp
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string()),
        goals,
        ratio,
    }
}

fn goal_cell(result: Option<&GoalResult>) -> &'static str {
    match result {
        Some(r) if r.done => "✓",
        Some(_) => "✗",
        None => "-",
    }
}

fn overall(results: &CampaignResults) -> String {
    format!(
        "{} of {} goals met, {} of {} item checks passing ({})",
        results.goals_done,
        results.goals_total,
        results.done_count,
        results.total_count,
        percent(results.ratio)
    )
}

fn date_range(summary: &CampaignSummary) -> String {
    match summary.campaign_end_date {
        Some(end) => format!("{} to {}", summary.campaign_start_date, end),
        None => format!("since {}", summary.campaign_start_date),
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

fn signed_percent(ratio: f64) -> String {
    format!("{:+.1}%", ratio * 100.0)
}

fn write_page(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("page path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating page directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("moving page into place at {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "page written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pacetrack_core::{CampaignGoalResult, Comparator, ItemFeatures};
    use pacetrack_sync::{goal_deltas, CampaignConfig, CampaignState, ItemRecord};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn config() -> CampaignConfig {
        serde_yaml::from_str(
            r#"
name: Coffee <drinks>
description: Improve caffeinated articles
campaign_start_date: 2024-01-01
article_list:
  type: sparql_json_file
  path: articles.json
  title_key: title
"#,
        )
        .expect("config")
    }

    fn state(ts: &str, done: usize, with_items: bool) -> CampaignState {
        let goal_results = vec![CampaignGoalResult::from_counts(
            "article_exists",
            "Article exists",
            done,
            2,
            1.0,
        )];
        let item_results = with_items.then(|| {
            ["Coffee", "Yerba mate"]
                .iter()
                .enumerate()
                .map(|(idx, title)| {
                    let mut features = ItemFeatures::missing(*title, at(ts));
                    if idx == 0 {
                        features.rev_id = Some(1002);
                    }
                    let done = features.exists();
                    let results = BTreeMap::from([(
                        "article_exists".to_string(),
                        GoalResult {
                            current: if done { 1.0 } else { 0.0 },
                            target: 1.0,
                            cmp: Comparator::Bool,
                            done,
                            remaining: if done { 0.0 } else { 1.0 },
                            progress: if done { 1.0 } else { 0.0 },
                        },
                    )]);
                    ItemRecord { features, results }
                })
                .collect()
        });
        CampaignState {
            campaign_id: "coffee".into(),
            timestamp: at(ts),
            save_date: None,
            campaign_results: Some(CampaignResults::from_goal_results(&goal_results)),
            goal_results,
            titles: vec!["Coffee".into(), "Yerba mate".into()],
            item_results,
        }
    }

    fn summary(latest: &CampaignState) -> CampaignSummary {
        CampaignSummary {
            id: "coffee".into(),
            name: "Coffee <drinks>".into(),
            lang: "en".into(),
            disabled: false,
            campaign_start_date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
            campaign_end_date: None,
            latest_timestamp: Some(latest.timestamp),
            results: latest.campaign_results,
        }
    }

    #[test]
    fn campaign_page_lists_goal_deltas_and_items() {
        let dir = tempdir().expect("tempdir");
        let renderer = StaticSiteRenderer::new(dir.path());
        let config = config();
        let start = state("2024-01-01T00:00:00Z", 0, false);
        let latest = state("2026-03-01T12:00:00Z", 1, true);
        let report = CampaignReport {
            summary: summary(&latest),
            config: &config,
            start_state: &start,
            latest_state: &latest,
            deltas: goal_deltas(&start, &latest),
        };

        renderer.render_campaign(&report).expect("render");

        let html = std::fs::read_to_string(renderer.campaign_page_path("coffee")).expect("page");
        assert!(html.contains("Coffee &lt;drinks&gt;"));
        assert!(html.contains("Improve caffeinated articles"));
        assert!(html.contains("0.0%"));
        assert!(html.contains("+50.0%"));
        assert!(html.contains("0 → 1"));
        assert!(html.contains("Yerba mate"));
        assert!(html.contains("2026-03-01 12:00 UTC"));
        let leftovers = std::fs::read_dir(dir.path().join("campaigns/coffee"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn index_skips_disabled_campaigns() {
        let dir = tempdir().expect("tempdir");
        let renderer = StaticSiteRenderer::new(dir.path().join("static"));
        let latest = state("2026-03-01T12:00:00Z", 2, false);
        let active = summary(&latest);
        let mut never = active.clone();
        never.id = "tea".into();
        never.name = "Tea".into();
        never.latest_timestamp = None;
        never.results = None;
        let mut disabled = active.clone();
        disabled.id = "mate".into();
        disabled.name = "Mate drive".into();
        disabled.disabled = true;

        renderer
            .render_index(&[active, never, disabled])
            .expect("render index");

        let html = std::fs::read_to_string(renderer.index_page_path()).expect("index");
        assert!(html.contains("campaigns/coffee/index.html"));
        assert!(html.contains("1/1"));
        assert!(html.contains("100.0%"));
        assert!(html.contains("campaigns/tea/index.html"));
        assert!(html.contains("never"));
        assert!(!html.contains("Mate drive"));
    }
}
