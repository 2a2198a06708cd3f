//! Persistence ports, roster stores, feed archive and feed fetching for orgrec.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orgrec_core::{
    ClosureEntry, DiffField, Employee, EmployeeId, FieldUpdate, HierarchyError, ReconReport,
    SupervisorEdge,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

mod pg;

pub use pg::PgRosterStore;

pub const CRATE_NAME: &str = "orgrec-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("roster store unavailable: {0}")]
    Unavailable(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("roster snapshot encoding failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("hierarchy integrity violation: {0}")]
    Integrity(#[from] HierarchyError),
    #[error("unknown employee {0}")]
    UnknownEmployee(EmployeeId),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Computes a replacement closure from the full direct-edge set.
pub type ClosureBuilder<'a> =
    &'a (dyn Fn(&[SupervisorEdge]) -> Result<Vec<ClosureEntry>, HierarchyError> + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClosureSwap {
    pub edges: usize,
    pub previous_entries: usize,
    pub entries: usize,
}

#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn load_roster(&self) -> Result<Vec<Employee>, StoreError>;

    async fn load_edges(&self) -> Result<Vec<SupervisorEdge>, StoreError>;

    async fn load_closure(&self) -> Result<Vec<ClosureEntry>, StoreError>;

    /// All ancestors of `report_id`, nearest first.
    async fn ancestors_of(&self, report_id: EmployeeId) -> Result<Vec<ClosureEntry>, StoreError>;

    /// Reads the edges and swaps in the closure built from them while holding
    /// the hierarchy exclusively. The stored closure is untouched when `build`
    /// fails.
    async fn rebuild_closure(&self, build: ClosureBuilder<'_>) -> Result<ClosureSwap, StoreError>;

    /// Replaces the direct supervisor of `employee_id` and swaps in the
    /// closure built from the resulting edges, under the same exclusive hold
    /// as `rebuild_closure`. Nothing is written when `build` rejects the new
    /// edge set.
    async fn set_supervisor(
        &self,
        employee_id: EmployeeId,
        supervisor_id: Option<EmployeeId>,
        build: ClosureBuilder<'_>,
    ) -> Result<ClosureSwap, StoreError>;

    /// Applies attribute writes all-or-nothing, returning how many values changed.
    async fn apply_field_updates(&self, updates: &[FieldUpdate]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLocation {
    pub run_id: Uuid,
    pub location: String,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write_report(&self, report: &ReconReport) -> anyhow::Result<ReportLocation>;
}

/// Keeps written reports in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    reports: RwLock<Vec<ReconReport>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<ReconReport> {
        self.reports.read().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn write_report(&self, report: &ReconReport) -> anyhow::Result<ReportLocation> {
        self.reports.write().await.push(report.clone());
        Ok(ReportLocation {
            run_id: report.run_id,
            location: format!("memory:{}", report.run_id),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    #[serde(default)]
    pub employees: Vec<Employee>,
    #[serde(default)]
    pub edges: Vec<SupervisorEdge>,
    #[serde(default)]
    pub closure: Vec<ClosureEntry>,
}

impl RosterSnapshot {
    fn employee_mut(&mut self, id: EmployeeId) -> Result<&mut Employee, StoreError> {
        self.employees
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::UnknownEmployee(id))
    }

    fn ensure_known(&self, id: EmployeeId) -> Result<(), StoreError> {
        if self.employees.iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(StoreError::UnknownEmployee(id))
        }
    }
}

/// Roster state behind a single lock, optionally mirrored to a JSON snapshot.
///
/// Every mutation is prepared on a copy, written to disk (when a path is set)
/// and only then swapped in, so readers never observe a half-applied change.
#[derive(Debug)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
    state: RwLock<RosterSnapshot>,
}

impl SnapshotStore {
    pub fn in_memory(snapshot: RosterSnapshot) -> Self {
        Self {
            path: None,
            state: RwLock::new(snapshot),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = fs::read_to_string(&path).await.map_err(|err| {
            StoreError::Unavailable(format!("reading roster snapshot {}: {err}", path.display()))
        })?;
        let snapshot: RosterSnapshot = serde_json::from_str(&text)?;
        info!(
            path = %path.display(),
            employees = snapshot.employees.len(),
            edges = snapshot.edges.len(),
            "opened roster snapshot"
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> RosterSnapshot {
        self.state.read().await.clone()
    }

    async fn persist(&self, snapshot: &RosterSnapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomically(path, &bytes).await
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|err| StoreError::io(parent, err))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|err| StoreError::io(&temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StoreError::io(&temp_path, err))?;
    file.flush()
        .await
        .map_err(|err| StoreError::io(&temp_path, err))?;
    drop(file);
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

#[async_trait]
impl RosterStore for SnapshotStore {
    async fn load_roster(&self) -> Result<Vec<Employee>, StoreError> {
        Ok(self.state.read().await.employees.clone())
    }

    async fn load_edges(&self) -> Result<Vec<SupervisorEdge>, StoreError> {
        Ok(self.state.read().await.edges.clone())
    }

    async fn load_closure(&self) -> Result<Vec<ClosureEntry>, StoreError> {
        Ok(self.state.read().await.closure.clone())
    }

    async fn ancestors_of(&self, report_id: EmployeeId) -> Result<Vec<ClosureEntry>, StoreError> {
        let state = self.state.read().await;
        let mut ancestors = state
            .closure
            .iter()
            .filter(|entry| entry.report_id == report_id)
            .copied()
            .collect::<Vec<_>>();
        ancestors.sort_by_key(|entry| entry.level);
        Ok(ancestors)
    }

    async fn rebuild_closure(&self, build: ClosureBuilder<'_>) -> Result<ClosureSwap, StoreError> {
        let mut state = self.state.write().await;
        let entries = build(&state.edges)?;
        let swap = ClosureSwap {
            edges: state.edges.len(),
            previous_entries: state.closure.len(),
            entries: entries.len(),
        };
        let mut next = state.clone();
        next.closure = entries;
        self.persist(&next).await?;
        *state = next;
        debug!(?swap, "closure swapped");
        Ok(swap)
    }

    async fn set_supervisor(
        &self,
        employee_id: EmployeeId,
        supervisor_id: Option<EmployeeId>,
        build: ClosureBuilder<'_>,
    ) -> Result<ClosureSwap, StoreError> {
        let mut state = self.state.write().await;
        state.ensure_known(employee_id)?;
        let mut next = state.clone();
        next.edges.retain(|edge| edge.employee_id != employee_id);
        if let Some(supervisor_id) = supervisor_id {
            next.ensure_known(supervisor_id)?;
            next.edges.push(SupervisorEdge {
                employee_id,
                supervisor_id,
            });
            next.edges.sort();
        }
        next.closure = build(&next.edges)?;
        let swap = ClosureSwap {
            edges: next.edges.len(),
            previous_entries: state.closure.len(),
            entries: next.closure.len(),
        };
        self.persist(&next).await?;
        *state = next;
        debug!(%employee_id, ?supervisor_id, ?swap, "supervisor set");
        Ok(swap)
    }

    async fn apply_field_updates(&self, updates: &[FieldUpdate]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut changed = 0usize;
        for update in updates {
            let employee = next.employee_mut(update.employee_id)?;
            let slot = match update.field {
                DiffField::Department => &mut employee.department,
                DiffField::JobTitle => &mut employee.job_title,
            };
            if *slot != update.value {
                slot.clone_from(&update.value);
                changed += 1;
            }
        }
        self.persist(&next).await?;
        *state = next;
        Ok(changed)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedFeed {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed copies of every raw feed a pass consumed.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path_for(
        &self,
        received_at: DateTime<Utc>,
        feed_name: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = received_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(feed_name)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive raw feed bytes; identical content lands on the same path once.
    pub async fn archive(
        &self,
        received_at: DateTime<Utc>,
        feed_name: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedFeed> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.relative_path_for(received_at, feed_name, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !exists {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving feed to {}", absolute_path.display()))?;
        }

        Ok(ArchivedFeed {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Downloads external-list feeds published over HTTP.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl FeedFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let span = info_span!("feed_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let mut attempt = 0usize;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedFeed {
                            final_url,
                            content_type,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying feed fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn employee(id: i64, first: &str, last: &str) -> Employee {
        Employee {
            id: EmployeeId(id),
            first_name: first.into(),
            last_name: last.into(),
            department: "Biology".into(),
            job_title: "Professor".into(),
            contact: format!("{}@org.edu", first.to_lowercase()),
            active: true,
        }
    }

    fn snapshot() -> RosterSnapshot {
        RosterSnapshot {
            employees: vec![employee(1, "Ana", "Ruiz"), employee(2, "Ben", "Cole")],
            edges: vec![SupervisorEdge {
                employee_id: EmployeeId(2),
                supervisor_id: EmployeeId(1),
            }],
            closure: vec![],
        }
    }

    fn single_level(edges: &[SupervisorEdge]) -> Result<Vec<ClosureEntry>, HierarchyError> {
        Ok(edges
            .iter()
            .map(|edge| ClosureEntry {
                report_id: edge.employee_id,
                level: 1,
                supervisor_id: edge.supervisor_id,
            })
            .collect())
    }

    #[test]
    fn feed_hashing_is_stable() {
        let hash = FeedArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_feeds() {
        let dir = tempdir().expect("tempdir");
        let archive = FeedArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive(received_at, "hr-list", "csv", b"name\nSmith, John\n")
            .await
            .expect("first archive");
        let second = archive
            .archive(received_at, "hr-list", "csv", b"name\nSmith, John\n")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
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

    #[tokio::test]
    async fn failed_rebuild_leaves_previous_closure() {
        let store = SnapshotStore::in_memory(snapshot());
        store.rebuild_closure(&single_level).await.expect("rebuild");
        let before = store.load_closure().await.expect("closure");
        assert_eq!(before.len(), 1);

        let failing = |_: &[SupervisorEdge]| -> Result<Vec<ClosureEntry>, HierarchyError> {
            Err(HierarchyError::Cycle {
                members: vec![EmployeeId(1), EmployeeId(1)],
            })
        };
        let err = store.rebuild_closure(&failing).await.expect_err("cycle");
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(store.load_closure().await.expect("closure"), before);
    }

    #[tokio::test]
    async fn set_supervisor_replaces_existing_edge() {
        let store = SnapshotStore::in_memory(snapshot());
        store
            .set_supervisor(EmployeeId(2), None, &single_level)
            .await
            .expect("clear");
        let swap = store
            .set_supervisor(EmployeeId(1), Some(EmployeeId(2)), &single_level)
            .await
            .expect("assign");
        assert_eq!(swap.entries, 1);
        let edges = store.load_edges().await.expect("edges");
        assert_eq!(
            edges,
            vec![SupervisorEdge {
                employee_id: EmployeeId(1),
                supervisor_id: EmployeeId(2),
            }]
        );
        let closure = store.load_closure().await.expect("closure");
        assert_eq!(closure[0].supervisor_id, EmployeeId(2));

        let err = store
            .set_supervisor(EmployeeId(1), Some(EmployeeId(99)), &single_level)
            .await
            .expect_err("unknown supervisor");
        assert!(matches!(err, StoreError::UnknownEmployee(EmployeeId(99))));
    }

    #[tokio::test]
    async fn rejected_edge_set_writes_neither_edge_nor_closure() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roster.json");
        write_atomically(&path, &serde_json::to_vec(&snapshot()).expect("json"))
            .await
            .expect("seed");
        let store = SnapshotStore::open(&path).await.expect("open");
        store.rebuild_closure(&single_level).await.expect("rebuild");
        let before = store.snapshot().await;

        let looping = |edges: &[SupervisorEdge]| -> Result<Vec<ClosureEntry>, HierarchyError> {
            assert_eq!(edges.len(), 2);
            Err(HierarchyError::Cycle {
                members: vec![EmployeeId(1), EmployeeId(2), EmployeeId(1)],
            })
        };
        let err = store
            .set_supervisor(EmployeeId(1), Some(EmployeeId(2)), &looping)
            .await
            .expect_err("cycle");
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(store.snapshot().await, before);
        let reopened = SnapshotStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.snapshot().await, before);
    }

    #[tokio::test]
    async fn field_updates_are_all_or_nothing() {
        let store = SnapshotStore::in_memory(snapshot());
        let updates = vec![
            FieldUpdate {
                employee_id: EmployeeId(1),
                field: DiffField::Department,
                value: "Chemistry".into(),
            },
            FieldUpdate {
                employee_id: EmployeeId(42),
                field: DiffField::JobTitle,
                value: "Dean".into(),
            },
        ];
        assert!(store.apply_field_updates(&updates).await.is_err());
        let roster = store.load_roster().await.expect("roster");
        assert_eq!(roster[0].department, "Biology");

        let changed = store
            .apply_field_updates(&updates[..1])
            .await
            .expect("apply");
        assert_eq!(changed, 1);
        assert_eq!(store.load_roster().await.expect("roster")[0].department, "Chemistry");
    }

    #[tokio::test]
    async fn snapshot_file_round_trips_mutations() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roster.json");
        std::fs::write(&path, serde_json::to_vec(&snapshot()).expect("json")).expect("seed");

        let store = SnapshotStore::open(&path).await.expect("open");
        store.rebuild_closure(&single_level).await.expect("rebuild");

        let reopened = SnapshotStore::open(&path).await.expect("reopen");
        let ancestors = reopened.ancestors_of(EmployeeId(2)).await.expect("ancestors");
        assert_eq!(ancestors.len(), 1);
        assert_eq!(ancestors[0].supervisor_id, EmployeeId(1));
    }

    #[tokio::test]
    async fn missing_snapshot_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let err = SnapshotStore::open(dir.path().join("nope.json"))
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
