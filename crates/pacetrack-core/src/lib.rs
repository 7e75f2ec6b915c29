//! Core campaign domain model, metric registry and goal evaluation for Pacetrack.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "pacetrack-core";

/// Configuration problems. These abort the current campaign, never a sibling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("goal `{goal}` references unknown metric `{metric}`")]
    UnknownMetric { goal: String, metric: String },
    #[error("goals `{first}` and `{second}` both map to key `{key}`")]
    DuplicateGoalKey {
        key: String,
        first: String,
        second: String,
    },
    #[error("invalid campaign id `{0}` (expected lowercase letters, digits and underscores)")]
    InvalidCampaignId(String),
    #[error("unsupported item list source type `{0}`")]
    UnsupportedItemSource(String),
    #[error("item list source `{kind}` requires field `{field}`")]
    MissingSourceField { kind: String, field: &'static str },
    #[error("invalid frequency `{0}`")]
    InvalidFrequency(String),
    #[error("goal `{goal}` has invalid arguments for metric `{metric}`: {source}")]
    InvalidMetricArgs {
        goal: String,
        metric: String,
        #[source]
        source: MetricError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("missing argument `{0}`")]
    MissingArgument(&'static str),
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument { name: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metric `{metric}` failed for goal `{goal}`: {source}")]
    Metric {
        goal: String,
        metric: String,
        #[source]
        source: MetricError,
    },
}

/// Lowercase, collapse every run of non-alphanumerics into one underscore.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn is_slug(input: &str) -> bool {
    !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn validate_campaign_id(id: &str) -> Result<(), ConfigError> {
    if is_slug(id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidCampaignId(id.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub importance: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationStats {
    pub reference_count: u64,
    pub reference_wikidata_count: u64,
}

impl CitationStats {
    pub fn wikidata_fraction(&self) -> f64 {
        if self.reference_count == 0 {
            0.0
        } else {
            self.reference_wikidata_count as f64 / self.reference_count as f64
        }
    }
}

/// Everything fetched about one item as of one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFeatures {
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub rev_id: Option<u64>,
    #[serde(default)]
    pub talk_rev_id: Option<u64>,
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub talk_templates: Vec<String>,
    #[serde(default)]
    pub assessments: BTreeMap<String, Assessment>,
    #[serde(default)]
    pub citations: Option<CitationStats>,
    #[serde(default)]
    pub wikidata_items: Vec<String>,
    /// Features whose fetch failed or did not finish in time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_features: Vec<String>,
}

impl ItemFeatures {
    /// Features of an item that does not exist at `timestamp`.
    pub fn missing(title: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            timestamp,
            rev_id: None,
            talk_rev_id: None,
            templates: Vec::new(),
            talk_templates: Vec::new(),
            assessments: BTreeMap::new(),
            citations: None,
            wikidata_items: Vec::new(),
            missing_features: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.rev_id.is_some()
    }

    pub fn talk_exists(&self) -> bool {
        self.talk_rev_id.is_some()
    }

    /// Project memberships derived from the talk page's banner templates.
    pub fn wikiprojects(&self) -> Vec<String> {
        self.talk_templates
            .iter()
            .filter(|t| t.to_lowercase().contains("wikiproject"))
            .map(|t| t.replace("WikiProject ", ""))
            .collect()
    }
}

pub type MetricArgs = BTreeMap<String, JsonValue>;
pub type MetricFn = fn(&ItemFeatures, &MetricArgs) -> Result<f64, MetricError>;

fn arg_str<'a>(args: &'a MetricArgs, name: &'static str) -> Result<Option<&'a str>, MetricError> {
    match args.get(name) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(MetricError::InvalidArgument {
            name,
            message: format!("expected a string, got {other}"),
        }),
    }
}

fn arg_bool(args: &MetricArgs, name: &'static str, default: bool) -> Result<bool, MetricError> {
    match args.get(name) {
        None | Some(JsonValue::Null) => Ok(default),
        Some(JsonValue::Bool(b)) => Ok(*b),
        Some(other) => Err(MetricError::InvalidArgument {
            name,
            message: format!("expected a boolean, got {other}"),
        }),
    }
}

fn arg_str_list(args: &MetricArgs, name: &'static str) -> Result<Option<Vec<String>>, MetricError> {
    match args.get(name) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Array(values)) => values
            .iter()
            .map(|v| {
                v.as_str().map(ToString::to_string).ok_or_else(|| MetricError::InvalidArgument {
                    name,
                    message: format!("expected a list of strings, found {v}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(other) => Err(MetricError::InvalidArgument {
            name,
            message: format!("expected a list of strings, got {other}"),
        }),
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn fold_case(values: &[String], case_sensitive: bool) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| if case_sensitive { v.clone() } else { v.to_lowercase() })
        .collect()
}

fn metric_article_exists(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(flag(item.exists()))
}

fn metric_talk_exists(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(flag(item.talk_exists()))
}

fn metric_ref_count(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(item.citations.map(|c| c.reference_count as f64).unwrap_or(0.0))
}

fn metric_ref_wikidata_count(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(item
        .citations
        .map(|c| c.reference_wikidata_count as f64)
        .unwrap_or(0.0))
}

fn metric_ref_wikidata_percent(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(item
        .citations
        .map(|c| c.wikidata_fraction() * 100.0)
        .unwrap_or(0.0))
}

fn metric_wikidata_item(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(item.wikidata_items.len() as f64)
}

fn metric_in_wikiproject(item: &ItemFeatures, args: &MetricArgs) -> Result<f64, MetricError> {
    let wikiproject = arg_str(args, "wikiproject")?.ok_or(MetricError::MissingArgument("wikiproject"))?;
    let case_sensitive = arg_bool(args, "case_sensitive", false)?;
    let projects = fold_case(&item.wikiprojects(), case_sensitive);
    let wanted = if case_sensitive {
        wikiproject.to_string()
    } else {
        wikiproject.to_lowercase()
    };
    Ok(flag(projects.contains(&wanted)))
}

fn metric_template_count(item: &ItemFeatures, args: &MetricArgs) -> Result<f64, MetricError> {
    let case_sensitive = arg_bool(args, "case_sensitive", false)?;
    let single = arg_str(args, "template_name")?;
    let many = arg_str_list(args, "template_names")?;
    let pattern = arg_str(args, "template_regex")?;

    let names = match (single, many) {
        (Some(_), Some(_)) => {
            return Err(MetricError::InvalidArgument {
                name: "template_name",
                message: "expected one of `template_name` or `template_names`, not both".to_string(),
            })
        }
        (Some(name), None) => Some(vec![name.to_string()]),
        (None, many) => many,
    };

    let article_templates = fold_case(&item.templates, case_sensitive);

    if let Some(pattern) = pattern {
        let pattern = if case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){pattern}")
        };
        let re = Regex::new(&pattern).map_err(|e| MetricError::InvalidArgument {
            name: "template_regex",
            message: e.to_string(),
        })?;
        return Ok(article_templates.iter().filter(|t| re.is_match(t)).count() as f64);
    }

    match names {
        Some(names) => {
            let wanted = fold_case(&names, case_sensitive);
            Ok(wanted.intersection(&article_templates).count() as f64)
        }
        None => Ok(article_templates.len() as f64),
    }
}

fn metric_has_infobox(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(flag(
        item.templates
            .iter()
            .any(|t| t.to_lowercase().contains("infobox")),
    ))
}

fn metric_has_infobox_wikidata(item: &ItemFeatures, _args: &MetricArgs) -> Result<f64, MetricError> {
    Ok(flag(item.templates.iter().any(|t| {
        let lower = t.to_lowercase();
        lower
            .find("infobox")
            .map(|start| lower[start..].contains("/wikidata"))
            .unwrap_or(false)
    })))
}

/// Ordinal rank for the standard quality scale; unknown classes rank 0.
pub fn quality_rank(class: &str) -> u8 {
    match class.trim().to_ascii_lowercase().as_str() {
        "stub" => 1,
        "start" => 2,
        "c" => 3,
        "b" => 4,
        "ga" => 5,
        "a" => 6,
        "fa" => 7,
        _ => 0,
    }
}

fn metric_assessment_rank(item: &ItemFeatures, args: &MetricArgs) -> Result<f64, MetricError> {
    let wikiproject = arg_str(args, "wikiproject")?;
    let rank = item
        .assessments
        .iter()
        .filter(|(project, _)| wikiproject.map(|w| w.eq_ignore_ascii_case(project)).unwrap_or(true))
        .filter_map(|(_, a)| a.class.as_deref().map(quality_rank))
        .max()
        .unwrap_or(0);
    Ok(rank as f64)
}

/// Registry mapping metric identifiers to scoring functions.
#[derive(Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, MetricFn>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, metric: MetricFn) {
        self.metrics.insert(name.into(), metric);
    }

    pub fn get(&self, name: &str) -> Option<MetricFn> {
        self.metrics.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("article_exists", metric_article_exists);
        registry.register("talk_exists", metric_talk_exists);
        registry.register("ref_count", metric_ref_count);
        registry.register("ref_wikidata_count", metric_ref_wikidata_count);
        registry.register("ref_wikidata_percent", metric_ref_wikidata_percent);
        registry.register("wikidata_item", metric_wikidata_item);
        registry.register("in_wikiproject", metric_in_wikiproject);
        registry.register("template_count", metric_template_count);
        registry.register("has_infobox", metric_has_infobox);
        registry.register("has_infobox_wikidata", metric_has_infobox_wikidata);
        registry.register("assessment_rank", metric_assessment_rank);
        registry
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.metrics.keys()).finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    #[default]
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Bool,
}

impl Comparator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ge => "ge",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Lt => "lt",
            Self::Eq => "eq",
            Self::Bool => "bool",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Bool => "is",
        }
    }

    pub fn compare(&self, current: f64, target: f64) -> bool {
        match self {
            Self::Ge => current >= target,
            Self::Gt => current > target,
            Self::Le => current <= target,
            Self::Lt => current < target,
            Self::Eq => (current - target).abs() < f64::EPSILON,
            Self::Bool => truthy(current),
        }
    }
}

pub fn truthy(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

fn default_target() -> f64 {
    1.0
}

fn default_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub name: String,
    pub metric: String,
    #[serde(default)]
    pub metric_args: MetricArgs,
    #[serde(default = "default_target")]
    pub target: f64,
    #[serde(default)]
    pub cmp: Comparator,
    /// Fraction of items that must meet the goal for the campaign to count it done.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    #[serde(default)]
    pub description: Option<String>,
}

impl Goal {
    pub fn key(&self) -> String {
        slugify(&self.name)
    }
}

/// Outcome of one goal against one item.
///
/// Boolean goals carry the same shape as numeric ones: `current` is 1.0 or
/// 0.0, `target` is 1.0, and `remaining`/`progress` follow from `done`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalResult {
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub target: f64,
    #[serde(default)]
    pub cmp: Comparator,
    pub done: bool,
    #[serde(default)]
    pub remaining: f64,
    #[serde(default)]
    pub progress: f64,
}

pub fn evaluate_goal(
    goal: &Goal,
    item: &ItemFeatures,
    registry: &MetricRegistry,
) -> Result<GoalResult, EvaluationError> {
    let metric = registry.get(&goal.metric).ok_or_else(|| ConfigError::UnknownMetric {
        goal: goal.name.clone(),
        metric: goal.metric.clone(),
    })?;
    let value = metric(item, &goal.metric_args).map_err(|source| EvaluationError::Metric {
        goal: goal.name.clone(),
        metric: goal.metric.clone(),
        source,
    })?;
    Ok(score(goal, value))
}

fn score(goal: &Goal, value: f64) -> GoalResult {
    if goal.cmp == Comparator::Bool {
        let done = truthy(value);
        return GoalResult {
            current: flag(done),
            target: 1.0,
            cmp: Comparator::Bool,
            done,
            remaining: if done { 0.0 } else { 1.0 },
            progress: flag(done),
        };
    }

    let done = goal.cmp.compare(value, goal.target);
    let remaining = if done { 0.0 } else { goal.target - value };
    let progress = if goal.target == 0.0 {
        flag(done)
    } else {
        value / goal.target
    };
    GoalResult {
        current: value,
        target: goal.target,
        cmp: goal.cmp,
        done,
        remaining,
        progress,
    }
}

/// Goals validated against a registry, in configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalSet {
    entries: Vec<(String, Goal)>,
}

impl GoalSet {
    /// Rejects duplicate keys, unknown metrics and arguments a metric refuses.
    pub fn new(goals: Vec<Goal>, registry: &MetricRegistry) -> Result<Self, ConfigError> {
        let probe = ItemFeatures::missing("", DateTime::<Utc>::UNIX_EPOCH);
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        let mut entries = Vec::with_capacity(goals.len());

        for goal in goals {
            let key = goal.key();
            if let Some(first) = seen.get(&key) {
                return Err(ConfigError::DuplicateGoalKey {
                    key,
                    first: first.clone(),
                    second: goal.name.clone(),
                });
            }
            let metric = registry.get(&goal.metric).ok_or_else(|| ConfigError::UnknownMetric {
                goal: goal.name.clone(),
                metric: goal.metric.clone(),
            })?;
            metric(&probe, &goal.metric_args).map_err(|source| ConfigError::InvalidMetricArgs {
                goal: goal.name.clone(),
                metric: goal.metric.clone(),
                source,
            })?;
            seen.insert(key.clone(), goal.name.clone());
            entries.push((key, goal));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Goal)> {
        self.entries.iter().map(|(k, g)| (k.as_str(), g))
    }

    pub fn get(&self, key: &str) -> Option<&Goal> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, g)| g)
    }

    pub fn evaluate(
        &self,
        item: &ItemFeatures,
        registry: &MetricRegistry,
    ) -> Result<BTreeMap<String, GoalResult>, EvaluationError> {
        self.iter()
            .map(|(key, goal)| Ok((key.to_string(), evaluate_goal(goal, item, registry)?)))
            .collect()
    }
}

pub fn evaluate_all_goals(
    goals: &[Goal],
    item: &ItemFeatures,
    registry: &MetricRegistry,
) -> Result<BTreeMap<String, GoalResult>, EvaluationError> {
    let set = GoalSet::new(goals.to_vec(), registry)?;
    set.evaluate(item, registry)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignGoalResult {
    pub key: String,
    pub name: String,
    pub done_count: usize,
    pub not_done_count: usize,
    pub total_count: usize,
    pub ratio: f64,
    pub target_ratio: f64,
    pub done: bool,
    pub progress: f64,
}

impl CampaignGoalResult {
    pub fn from_counts(
        key: impl Into<String>,
        name: impl Into<String>,
        done_count: usize,
        total_count: usize,
        target_ratio: f64,
    ) -> Self {
        let not_done_count = total_count.saturating_sub(done_count);
        let ratio = if total_count == 0 {
            1.0
        } else {
            done_count as f64 / total_count as f64
        };
        let progress = if target_ratio <= 0.0 {
            1.0
        } else {
            ratio / target_ratio
        };
        Self {
            key: key.into(),
            name: name.into(),
            done_count,
            not_done_count,
            total_count,
            ratio,
            target_ratio,
            done: ratio >= target_ratio,
            progress,
        }
    }
}

/// Per-goal counts across items. Items missing a goal's result count as not done.
pub fn aggregate_goal_results<'a>(
    goals: &GoalSet,
    item_results: impl IntoIterator<Item = &'a BTreeMap<String, GoalResult>>,
) -> Vec<CampaignGoalResult> {
    let mut done: BTreeMap<&str, usize> = BTreeMap::new();
    let mut total = 0usize;
    for results in item_results {
        total += 1;
        for (key, _) in goals.iter() {
            if results.get(key).map(|r| r.done).unwrap_or(false) {
                *done.entry(key).or_default() += 1;
            }
        }
    }

    goals
        .iter()
        .map(|(key, goal)| {
            CampaignGoalResult::from_counts(
                key,
                goal.name.clone(),
                done.get(key).copied().unwrap_or(0),
                total,
                goal.ratio,
            )
        })
        .collect()
}

/// Campaign-level rollup of the per-goal counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignResults {
    pub done_count: usize,
    pub not_done_count: usize,
    pub total_count: usize,
    pub goals_done: usize,
    pub goals_total: usize,
    pub ratio: f64,
}

impl CampaignResults {
    pub fn from_goal_results(goal_results: &[CampaignGoalResult]) -> Self {
        let done_count = goal_results.iter().map(|g| g.done_count).sum::<usize>();
        let not_done_count = goal_results.iter().map(|g| g.not_done_count).sum::<usize>();
        let total_count = goal_results.iter().map(|g| g.total_count).sum::<usize>();
        let ratio = if total_count == 0 {
            1.0
        } else {
            done_count as f64 / total_count as f64
        };
        Self {
            done_count,
            not_done_count,
            total_count,
            goals_done: goal_results.iter().filter(|g| g.done).count(),
            goals_total: goal_results.len(),
            ratio,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid frequency format: {0}")]
    InvalidFormat(String),
    #[error("invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),
    #[error("invalid unit: {0}")]
    InvalidUnit(String),
}

/// Interval with human-readable parsing (`90s`, `30m`, `4h`, `1d`, `2w`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frequency(pub Duration);

impl Frequency {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_time_delta(&self) -> TimeDelta {
        TimeDelta::seconds(self.0.as_secs().min(i64::MAX as u64) as i64)
    }

    pub fn to_human_readable(&self) -> String {
        const UNITS: &[(&str, u64)] = &[("w", 604_800), ("d", 86_400), ("h", 3_600), ("m", 60)];
        let secs = self.0.as_secs();
        for &(unit, divisor) in UNITS {
            if secs >= divisor && secs % divisor == 0 {
                return format!("{}{}", secs / divisor, unit);
            }
        }
        format!("{secs}s")
    }
}

impl FromStr for Frequency {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self::from_secs(secs));
        }

        let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) else {
            return Err(ParseError::InvalidFormat(s));
        };
        let (num_str, unit) = s.split_at(pos);
        if num_str.is_empty() {
            return Err(ParseError::InvalidFormat(s.clone()));
        }
        let num: u64 = num_str.parse()?;

        let multiplier = match unit.trim() {
            "s" | "sec" | "secs" | "seconds" => 1,
            "m" | "min" | "mins" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            other => return Err(ParseError::InvalidUnit(other.to_string())),
        };

        Ok(Self::from_secs(num.saturating_mul(multiplier)))
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

impl Serialize for Frequency {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_human_readable())
    }
}

impl<'de> Deserialize<'de> for Frequency {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FrequencyVisitor;

        impl serde::de::Visitor<'_> for FrequencyVisitor {
            type Value = Frequency;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an interval as string (e.g. \"30m\", \"1d\") or integer seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Frequency::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(Frequency::from_secs)
                    .map_err(|_| E::custom(ConfigError::InvalidFrequency(v.to_string())))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<Frequency>()
                    .map_err(|_| E::custom(ConfigError::InvalidFrequency(v.to_string())))
            }
        }

        deserializer.deserialize_any(FrequencyVisitor)
    }
}
