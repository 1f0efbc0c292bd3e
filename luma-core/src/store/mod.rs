//! Persistence ports consumed by the core, plus the two backends.
//!
//! The ports keep backend types out of the rest of the crate: the Postgres
//! implementation lives in [`postgres`], and [`memory`] provides the
//! reference semantics used by the test suite. The transactional-enqueue
//! primitive is [`AssetStore::commit_asset`]: the asset row and its
//! follow-up jobs become visible atomically or not at all.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use luma_model::{
    AssetId, AssetKind, AssetRecord, FileRecord, JobId, RepositoryId, ScoredLabel, SyncOpId,
    SyncOpKind, SyncOpStatus, SyncOperation, SyncStats,
};
use serde_json::Value;

use crate::error::Result;
use crate::queue::payload::JobPayload;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Insert-shape for a new asset row. The caller mints the id so follow-up
/// job payloads can reference the asset before the insert commits.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub id: AssetId,
    pub repository_id: RepositoryId,
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    pub mime: String,
    pub kind: AssetKind,
    pub owner: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub taken_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

/// Insert-shape for a new job row. `available_at` in the future makes the
/// job invisible to workers until then.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: JobPayload,
    pub available_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            available_at: Utc::now(),
        }
    }

    pub fn delayed(payload: JobPayload, delay: std::time::Duration) -> Self {
        Self {
            payload,
            available_at: Utc::now()
                + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64),
        }
    }
}

/// Job lifecycle states as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Available,
    Running,
    Completed,
    Retryable,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "retryable" => Ok(JobState::Retryable),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Envelope persisted for each job.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u16,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proof of lease ownership handed to a worker on dequeue. Completion calls
/// must present it; a stale token (lease expired and re-leased elsewhere)
/// is rejected by the store.
#[derive(Debug, Clone)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A leased job: the row plus the token required to settle it.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: JobRow,
    pub token: LeaseToken,
}

/// Durable queue persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job; it is visible to workers once `available_at` passes.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Lease the oldest available job on `queue`, bumping its attempt count.
    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<LeasedJob>>;

    async fn complete(&self, token: &LeaseToken) -> Result<()>;

    /// Record a failure. `retry_at = Some(_)` sends the job back to
    /// available at that time; `None` is terminal.
    async fn fail(&self, token: &LeaseToken, error: &str, retry_at: Option<DateTime<Utc>>)
    -> Result<()>;

    /// Send the job back to available at `until` without consuming an
    /// attempt.
    async fn snooze(&self, token: &LeaseToken, until: DateTime<Utc>) -> Result<()>;

    /// Re-queue jobs whose lease expired (worker crash or missed shutdown
    /// deadline). Returns how many were recovered.
    async fn recover_expired_leases(&self) -> Result<u64>;

    async fn queue_depth(&self, queue: &str) -> Result<usize>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRow>>;
}

/// Asset rows plus the transactional-enqueue primitive.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Dedup lookup on the `(repository, content hash)` key. Soft-deleted
    /// rows do not count.
    async fn find_by_hash(&self, repo: RepositoryId, hash: &str) -> Result<Option<AssetRecord>>;

    /// Insert the asset row and its follow-up jobs in one atomic unit. A
    /// concurrent ingest of the same content surfaces as
    /// [`CoreError::Conflict`](crate::error::CoreError::Conflict) and
    /// leaves no partial state.
    async fn commit_asset(&self, asset: NewAsset, follow_ups: Vec<NewJob>) -> Result<AssetId>;

    /// Shallow-merge additional metadata keys onto the record.
    async fn attach_metadata(&self, asset: AssetId, metadata: Value) -> Result<()>;

    async fn record_embedding(&self, asset: AssetId, vector: Vec<f32>, model_id: &str)
    -> Result<()>;

    async fn record_labels(
        &self,
        asset: AssetId,
        labels: Vec<ScoredLabel>,
        model_id: &str,
        source: Option<String>,
    ) -> Result<()>;

    async fn get_asset(&self, asset: AssetId) -> Result<Option<AssetRecord>>;

    async fn soft_delete(&self, asset: AssetId) -> Result<()>;
}

/// File records for user-managed directories.
#[async_trait]
pub trait FileRecordStore: Send + Sync {
    /// Upsert a batch in one transaction, keyed on `(repository, rel_path)`.
    async fn batch_upsert(&self, repo: RepositoryId, records: Vec<FileRecord>) -> Result<()>;

    /// Remove the record for one path. Returns whether a row existed.
    async fn delete_by_path(&self, repo: RepositoryId, rel_path: &str) -> Result<bool>;

    async fn list_for_repository(&self, repo: RepositoryId) -> Result<Vec<FileRecord>>;

    async fn get_record(&self, repo: RepositoryId, rel_path: &str) -> Result<Option<FileRecord>>;

    /// Convenience for the watcher's single-path upserts.
    async fn upsert(&self, record: FileRecord) -> Result<()> {
        let repo = record.repository_id;
        self.batch_upsert(repo, vec![record]).await
    }
}

/// Sync-run audit rows.
#[async_trait]
pub trait SyncOpStore: Send + Sync {
    async fn open(&self, repo: RepositoryId, kind: SyncOpKind) -> Result<SyncOpId>;

    /// Set the terminal status exactly once; later calls are rejected.
    async fn close(
        &self,
        op: SyncOpId,
        stats: SyncStats,
        status: SyncOpStatus,
        error: Option<String>,
    ) -> Result<()>;

    async fn latest_for_repository(&self, repo: RepositoryId) -> Result<Option<SyncOperation>>;
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
