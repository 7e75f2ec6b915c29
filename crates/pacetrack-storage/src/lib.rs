//! Dated snapshot storage + HTTP fetch utilities for Pacetrack.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pacetrack-storage";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const BUCKET_FORMAT: &str = "%Y%m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Aggregates and item titles only.
    Light,
    /// Aggregates plus per-item detail, gzip compressed.
    Full,
}

impl SnapshotKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Light => "state_",
            Self::Full => "state_full_",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Light => ".json",
            Self::Full => ".json.gz",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub kind: SnapshotKind,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot found: {0}")]
    NotFound(String),
    #[error("snapshot already exists at {0}")]
    Collision(PathBuf),
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SnapshotError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrittenPair {
    pub light: PathBuf,
    pub full: PathBuf,
}

/// Which files in a family survive a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub keep: Vec<PathBuf>,
    pub prune: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub bucket: Option<String>,
    pub light: PrunePlan,
    pub full: PrunePlan,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn pruned_count(&self) -> usize {
        self.light.prune.len() + self.full.prune.len()
    }

    pub fn kept_count(&self) -> usize {
        self.light.keep.len() + self.full.keep.len()
    }
}

/// Greedy forward scan over files sorted oldest first.
///
/// The first and last file are always kept. An interior file is kept when it
/// is at least `spacing` after the most recently kept one.
pub fn plan_retention(files: &[SnapshotFile], spacing: TimeDelta) -> PrunePlan {
    let mut plan = PrunePlan::default();
    let Some((first, rest)) = files.split_first() else {
        return plan;
    };
    plan.keep.push(first.path.clone());
    let Some((last, interior)) = rest.split_last() else {
        return plan;
    };

    let mut last_kept = first.timestamp;
    for file in interior {
        if file.timestamp - last_kept >= spacing {
            last_kept = file.timestamp;
            plan.keep.push(file.path.clone());
        } else {
            plan.prune.push(file.path.clone());
        }
    }
    plan.keep.push(last.path.clone());
    plan
}

/// On-disk layout for one campaign: `<root>/<YYYYMM>/state_*.json` and
/// `<root>/<YYYYMM>/state_full_*.json.gz`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_name(timestamp: DateTime<Utc>) -> String {
        timestamp.format(BUCKET_FORMAT).to_string()
    }

    pub fn file_name(kind: SnapshotKind, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            kind.prefix(),
            timestamp.format(STAMP_FORMAT),
            kind.extension()
        )
    }

    pub fn path_for(&self, kind: SnapshotKind, timestamp: DateTime<Utc>) -> PathBuf {
        self.root
            .join(Self::bucket_name(timestamp))
            .join(Self::file_name(kind, timestamp))
    }

    /// Recognizes a snapshot file name, returning its family and encoded timestamp.
    pub fn parse_file_name(name: &str) -> Option<(SnapshotKind, DateTime<Utc>)> {
        // Full is checked first since its prefix also starts with the light one.
        let (kind, stamp) = if let Some(rest) = name.strip_prefix(SnapshotKind::Full.prefix()) {
            (SnapshotKind::Full, rest.strip_suffix(SnapshotKind::Full.extension())?)
        } else {
            let rest = name.strip_prefix(SnapshotKind::Light.prefix())?;
            (SnapshotKind::Light, rest.strip_suffix(SnapshotKind::Light.extension())?)
        };
        let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
        Some((kind, naive.and_utc()))
    }

    /// Numeric `YYYYMM` bucket directories, oldest first.
    pub async fn list_buckets(&self) -> Result<Vec<String>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SnapshotError::io(&self.root, err)),
        };

        let mut buckets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::io(&self.root, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SnapshotError::io(&entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() == 6 && name.chars().all(|c| c.is_ascii_digit()) {
                buckets.push(name);
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    pub async fn latest_bucket(&self) -> Result<String, SnapshotError> {
        self.list_buckets().await?.pop().ok_or_else(|| {
            SnapshotError::NotFound(format!("no dated directories under {}", self.root.display()))
        })
    }

    /// Files of one family inside a bucket, oldest first. A missing bucket is empty.
    pub async fn list_snapshots(
        &self,
        bucket: &str,
        kind: SnapshotKind,
    ) -> Result<Vec<SnapshotFile>, SnapshotError> {
        let dir = self.root.join(bucket);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SnapshotError::io(&dir, err)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((found, timestamp)) = Self::parse_file_name(&name) {
                if found == kind {
                    files.push(SnapshotFile {
                        kind,
                        timestamp,
                        path: entry.path(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(files)
    }

    /// Lexicographically latest file of `kind` in the latest bucket.
    pub async fn latest(&self, kind: SnapshotKind) -> Result<SnapshotFile, SnapshotError> {
        let bucket = self.latest_bucket().await?;
        self.list_snapshots(&bucket, kind)
            .await?
            .pop()
            .ok_or_else(|| {
                SnapshotError::NotFound(format!(
                    "no {} snapshot in {}",
                    kind.as_str(),
                    self.root.join(&bucket).display()
                ))
            })
    }

    /// First snapshot of `kind` whose encoded date is the same day as `timestamp`.
    pub async fn find_on_day(
        &self,
        kind: SnapshotKind,
        timestamp: DateTime<Utc>,
    ) -> Result<SnapshotFile, SnapshotError> {
        let bucket = Self::bucket_name(timestamp);
        let day = timestamp.date_naive();
        self.list_snapshots(&bucket, kind)
            .await?
            .into_iter()
            .find(|f| f.timestamp.date_naive() == day)
            .ok_or_else(|| {
                SnapshotError::NotFound(format!(
                    "no {} snapshot on {} in {}",
                    kind.as_str(),
                    day,
                    self.root.join(&bucket).display()
                ))
            })
    }

    /// Writes both variants for one logical timestamp.
    ///
    /// Each file is published with an exclusive link, so a second save in the
    /// same second fails with `Collision` and leaves the first pair intact.
    pub async fn write_pair(
        &self,
        timestamp: DateTime<Utc>,
        light_json: &[u8],
        full_json: &[u8],
    ) -> Result<WrittenPair, SnapshotError> {
        let light = self.path_for(SnapshotKind::Light, timestamp);
        let full = self.path_for(SnapshotKind::Full, timestamp);

        for target in [&light, &full] {
            if fs::try_exists(target)
                .await
                .map_err(|e| SnapshotError::io(target, e))?
            {
                return Err(SnapshotError::Collision(target.clone()));
            }
        }

        let compressed = gzip(full_json).map_err(|e| SnapshotError::io(&full, e))?;
        write_exclusive(&full, &compressed).await?;
        if let Err(err) = write_exclusive(&light, light_json).await {
            let _ = fs::remove_file(&full).await;
            return Err(err);
        }

        debug!(light = %light.display(), full = %full.display(), "snapshot pair written");
        Ok(WrittenPair { light, full })
    }

    /// Raw JSON bytes of a snapshot, decompressed when the path ends in `.gz`.
    pub async fn read_bytes(path: &Path) -> Result<Vec<u8>, SnapshotError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(path.display().to_string()))
            }
            Err(err) => return Err(SnapshotError::io(path, err)),
        };
        if path.extension().is_some_and(|ext| ext == "gz") {
            gunzip(&bytes).map_err(|e| SnapshotError::io(path, e))
        } else {
            Ok(bytes)
        }
    }

    pub async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
        let bytes = Self::read_bytes(path).await?;
        serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies the retention scan to the latest bucket, light and full families independently.
    pub async fn prune(&self, spacing: TimeDelta, dry_run: bool) -> Result<PruneReport, SnapshotError> {
        let bucket = match self.latest_bucket().await {
            Ok(bucket) => bucket,
            Err(SnapshotError::NotFound(_)) => {
                return Ok(PruneReport {
                    dry_run,
                    ..PruneReport::default()
                })
            }
            Err(err) => return Err(err),
        };

        let light = plan_retention(&self.list_snapshots(&bucket, SnapshotKind::Light).await?, spacing);
        let full = plan_retention(&self.list_snapshots(&bucket, SnapshotKind::Full).await?, spacing);

        if !dry_run {
            for path in light.prune.iter().chain(full.prune.iter()) {
                match fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(SnapshotError::io(path, err)),
                }
            }
        }

        let report = PruneReport {
            bucket: Some(bucket),
            light,
            full,
            dry_run,
        };
        info!(
            root = %self.root.display(),
            bucket = report.bucket.as_deref().unwrap_or_default(),
            kept = report.kept_count(),
            pruned = report.pruned_count(),
            dry_run,
            "snapshot retention applied"
        );
        Ok(report)
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Temp file in the target directory, then a hard link that fails if the target exists.
async fn write_exclusive(target: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let parent = target
        .parent()
        .ok_or_else(|| SnapshotError::io(target, std::io::Error::other("snapshot path has no parent")))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| SnapshotError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| SnapshotError::io(&temp_path, e))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(SnapshotError::io(&temp_path, err));
    }

    let linked = fs::hard_link(&temp_path, target).await;
    let _ = fs::remove_file(&temp_path).await;
    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(SnapshotError::Collision(target.to_path_buf()))
        }
        Err(err) => Err(SnapshotError::io(target, err)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_endpoint_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 32,
            per_endpoint_concurrency: 8,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Request budget shared by every endpoint: `capacity` requests up front,
/// then one more each `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct RequestRateLimiter {
    limit: RateLimit,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimiterState {
    available: u32,
    refilled_at: Instant,
}

impl RequestRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            capacity: limit.capacity.max(1),
            refill_every: limit.refill_every.max(Duration::from_millis(1)),
        };
        Self {
            limit,
            state: Mutex::new(RateLimiterState {
                available: limit.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Waits until a request slot is free and claims it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let periods = (now.duration_since(state.refilled_at).as_nanos()
                    / self.limit.refill_every.as_nanos()) as u32;
                if periods > 0 {
                    state.available = state.available.saturating_add(periods).min(self.limit.capacity);
                    // Partial periods carry over to the next refill.
                    state.refilled_at += self.limit.refill_every * periods;
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                (state.refilled_at + self.limit.refill_every).saturating_duration_since(now)
            };
            debug!(wait_ms = wait.as_millis() as u64, "request budget exhausted; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Shared client for the reference API: global and per-endpoint limits,
/// an optional request rate limit, and backoff on retryable transport failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_endpoint_limit: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<RequestRateLimiter>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limiter = config.rate_limit.map(RequestRateLimiter::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_endpoint_limit: config.per_endpoint_concurrency.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
            rate_limiter,
            backoff: config.backoff,
        })
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limiter.as_ref().map(RequestRateLimiter::limit)
    }

    async fn endpoint_semaphore(&self, endpoint: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
            .clone()
    }

    /// GET `url`, retrying 429/5xx and connect/timeout failures per the backoff policy.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_endpoint = self.endpoint_semaphore(endpoint).await;
        let _endpoint = per_endpoint.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!("http_fetch", %run_id, endpoint, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let retry = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            match retry {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    debug!(attempt, error = %err, "retrying request");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn file_names_encode_second_precision_and_family() {
        let ts = at("2026-03-01T12:34:56Z");
        assert_eq!(
            SnapshotStore::file_name(SnapshotKind::Light, ts),
            "state_20260301_123456.json"
        );
        assert_eq!(
            SnapshotStore::file_name(SnapshotKind::Full, ts),
            "state_full_20260301_123456.json.gz"
        );
        assert_eq!(SnapshotStore::bucket_name(ts), "202603");

        assert_eq!(
            SnapshotStore::parse_file_name("state_full_20260301_123456.json.gz"),
            Some((SnapshotKind::Full, ts))
        );
        assert_eq!(
            SnapshotStore::parse_file_name("state_20260301_123456.json"),
            Some((SnapshotKind::Light, ts))
        );
        assert_eq!(SnapshotStore::parse_file_name("state_full_20260301_123456.json"), None);
        assert_eq!(SnapshotStore::parse_file_name(".tmp.state_20260301.json"), None);
    }

    #[tokio::test]
    async fn pair_writes_are_exclusive_to_the_second() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let ts = at("2026-03-01T12:00:00Z");

        let pair = store
            .write_pair(ts, br#"{"v":1}"#, br#"{"v":1,"items":[]}"#)
            .await
            .expect("first write");
        assert!(pair.light.exists());
        assert!(pair.full.exists());

        let err = store
            .write_pair(ts, br#"{"v":2}"#, br#"{"v":2}"#)
            .await
            .expect_err("same second collides");
        assert!(matches!(err, SnapshotError::Collision(_)));

        let light: serde_json::Value = SnapshotStore::read_document(&pair.light).await.expect("light");
        let full: serde_json::Value = SnapshotStore::read_document(&pair.full).await.expect("full");
        assert_eq!(light["v"], 1);
        assert_eq!(full["items"], serde_json::json!([]));

        store
            .write_pair(ts + TimeDelta::seconds(1), b"{}", b"{}")
            .await
            .expect("next second is fine");

        let leftovers = std::fs::read_dir(dir.path().join("202603"))
            .expect("bucket")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn latest_and_day_lookup_distinguish_families() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert!(store.latest(SnapshotKind::Light).await.unwrap_err().is_not_found());

        for ts in [
            "2026-02-27T08:00:00Z",
            "2026-03-01T08:00:00Z",
            "2026-03-01T20:00:00Z",
            "2026-03-02T08:00:00Z",
        ] {
            store.write_pair(at(ts), b"{}", b"{}").await.expect("write");
        }

        assert_eq!(store.list_buckets().await.unwrap(), vec!["202602", "202603"]);
        let latest = store.latest(SnapshotKind::Light).await.unwrap();
        assert_eq!(latest.timestamp, at("2026-03-02T08:00:00Z"));
        assert_eq!(latest.kind, SnapshotKind::Light);
        let latest_full = store.latest(SnapshotKind::Full).await.unwrap();
        assert!(latest_full.path.to_string_lossy().ends_with("state_full_20260302_080000.json.gz"));

        let day = store
            .find_on_day(SnapshotKind::Light, at("2026-03-01T15:00:00Z"))
            .await
            .unwrap();
        assert_eq!(day.timestamp, at("2026-03-01T08:00:00Z"));

        let missing = store
            .find_on_day(SnapshotKind::Full, at("2026-03-05T00:00:00Z"))
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
        let missing_bucket = store
            .find_on_day(SnapshotKind::Full, at("2025-12-05T00:00:00Z"))
            .await
            .unwrap_err();
        assert!(missing_bucket.is_not_found());
    }

    #[test]
    fn retention_keeps_ends_and_spaced_interior() {
        let files = ["00:00", "01:00", "02:00", "02:30", "05:00", "05:10"]
            .iter()
            .map(|hm| SnapshotFile {
                kind: SnapshotKind::Light,
                timestamp: at(&format!("2026-03-01T{hm}:00Z")),
                path: PathBuf::from(hm),
            })
            .collect::<Vec<_>>();

        let plan = plan_retention(&files, TimeDelta::hours(2));
        assert_eq!(plan.keep, vec![PathBuf::from("00:00"), "02:00".into(), "05:00".into(), "05:10".into()]);
        assert_eq!(plan.prune, vec![PathBuf::from("01:00"), "02:30".into()]);

        assert_eq!(plan_retention(&files[..1], TimeDelta::hours(2)).keep.len(), 1);
        assert!(plan_retention(&[], TimeDelta::hours(2)).keep.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_middle_and_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        for ts in ["2026-03-01T10:00:00Z", "2026-03-01T11:00:00Z", "2026-03-01T12:00:00Z"] {
            store.write_pair(at(ts), b"{}", b"{}").await.expect("write");
        }

        let dry = store.prune(TimeDelta::hours(2), true).await.expect("dry run");
        assert_eq!(dry.pruned_count(), 2);
        assert_eq!(std::fs::read_dir(dir.path().join("202603")).unwrap().count(), 6);

        let real = store.prune(TimeDelta::hours(2), false).await.expect("prune");
        assert_eq!(real.light.prune, dry.light.prune);
        assert_eq!(real.full.prune, dry.full.prune);
        assert!(real.light.prune[0].to_string_lossy().ends_with("state_20260301_110000.json"));

        let light = store.list_snapshots("202603", SnapshotKind::Light).await.unwrap();
        assert_eq!(
            light.iter().map(|f| f.timestamp).collect::<Vec<_>>(),
            vec![at("2026-03-01T10:00:00Z"), at("2026-03-01T12:00:00Z")]
        );

        let again = store.prune(TimeDelta::hours(2), false).await.expect("second prune");
        assert_eq!(again.pruned_count(), 0);
    }

    #[tokio::test]
    async fn prune_without_snapshots_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("data"));
        let report = store.prune(TimeDelta::days(1), false).await.expect("prune");
        assert!(report.bucket.is_none());
        assert_eq!(report.pruned_count(), 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spends_burst_then_waits_for_refill() {
        let limiter = RequestRateLimiter::new(RateLimit {
            capacity: 2,
            refill_every: Duration::from_millis(500),
        });
        let started = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_secs(10)).await;
        let resumed = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(resumed.elapsed(), Duration::ZERO);
    }

    #[test]
    fn fetcher_reports_configured_rate_limit() {
        let unlimited = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        assert!(unlimited.rate_limit().is_none());

        let limit = RateLimit {
            capacity: 0,
            refill_every: Duration::ZERO,
        };
        let limited = HttpFetcher::new(HttpClientConfig {
            rate_limit: Some(limit),
            ..HttpClientConfig::default()
        })
        .expect("fetcher");
        assert_eq!(
            limited.rate_limit(),
            Some(RateLimit {
                capacity: 1,
                refill_every: Duration::from_millis(1),
            })
        );
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
