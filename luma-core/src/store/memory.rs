//! In-memory store backend.
//!
//! Implements every persistence port behind one mutex, giving the exact
//! atomicity the ports promise (batch upserts, `commit_asset`) without a
//! database. This is the reference semantics and the default test backend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use luma_model::{
    AssetId, AssetRecord, FileRecord, JobId, RepositoryId, ScoredLabel, SyncOpId, SyncOpKind,
    SyncOpStatus, SyncOperation, SyncStats,
};
use serde_json::{Value, json};

use crate::error::{CoreError, Result};
use crate::queue::payload::JobPayload;

use super::{
    AssetStore, FileRecordStore, JobRow, JobState, JobStore, LeaseToken, LeasedJob, NewAsset,
    NewJob, SyncOpStore,
};

#[derive(Default)]
struct Inner {
    assets: HashMap<AssetId, AssetRecord>,
    /// Dedup index over non-deleted assets.
    hash_index: HashMap<(RepositoryId, String), AssetId>,
    /// BTreeMap over v7 ids keeps jobs in approximate insertion order.
    jobs: BTreeMap<JobId, JobRow>,
    files: HashMap<(RepositoryId, String), FileRecord>,
    sync_ops: Vec<SyncOperation>,
}

/// Shared in-memory backend for all four ports.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.lock() {
            Ok(inner) => f
                .debug_struct("MemoryStore")
                .field("assets", &inner.assets.len())
                .field("jobs", &inner.jobs.len())
                .field("files", &inner.files.len())
                .field("sync_ops", &inner.sync_ops.len())
                .finish(),
            Err(_) => f.write_str("MemoryStore { <locked> }"),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every job on a queue, oldest first. Introspection for
    /// status surfaces and tests.
    pub fn jobs_in_queue(&self, queue: &str) -> Vec<JobRow> {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    /// Snapshot of every non-deleted asset in a repository.
    pub fn assets_in_repository(&self, repo: RepositoryId) -> Vec<AssetRecord> {
        self.lock()
            .assets
            .values()
            .filter(|asset| asset.repository_id == repo && !asset.is_deleted())
            .cloned()
            .collect()
    }

    fn insert_job(inner: &mut Inner, job: NewJob) -> JobId {
        let now = Utc::now();
        let id = JobId::new();
        let row = JobRow {
            id,
            queue: job.payload.queue_name().to_string(),
            payload: job.payload,
            state: JobState::Available,
            attempts: 0,
            available_at: job.available_at,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(id, row);
        id
    }

    fn held_job<'a>(inner: &'a mut Inner, token: &LeaseToken) -> Result<&'a mut JobRow> {
        let job = inner
            .jobs
            .get_mut(&token.job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {}", token.job_id)))?;
        if job.state != JobState::Running || job.lease_owner.as_deref() != Some(&token.worker_id) {
            return Err(CoreError::Conflict(format!(
                "lease on job {} no longer held by {}",
                token.job_id, token.worker_id
            )));
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let mut inner = self.lock();
        Ok(Self::insert_job(&mut inner, job))
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<LeasedJob>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let candidate = inner
            .jobs
            .values_mut()
            .filter(|job| job.queue == queue)
            .filter(|job| {
                matches!(job.state, JobState::Available | JobState::Retryable)
                    && job.available_at <= now
            })
            .min_by_key(|job| (job.available_at, job.id));

        let Some(job) = candidate else {
            return Ok(None);
        };

        job.state = JobState::Running;
        job.attempts = job.attempts.saturating_add(1);
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + lease_ttl);
        job.updated_at = now;

        let row = job.clone();
        let token = LeaseToken {
            job_id: row.id,
            worker_id: worker_id.to_string(),
            expires_at: now + lease_ttl,
        };
        Ok(Some(LeasedJob { job: row, token }))
    }

    async fn complete(&self, token: &LeaseToken) -> Result<()> {
        let mut inner = self.lock();
        let job = Self::held_job(&mut inner, token)?;
        job.state = JobState::Completed;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(
        &self,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let job = Self::held_job(&mut inner, token)?;
        job.last_error = Some(error.to_string());
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        match retry_at {
            Some(at) => {
                job.state = JobState::Retryable;
                job.available_at = at;
            }
            None => job.state = JobState::Failed,
        }
        Ok(())
    }

    async fn snooze(&self, token: &LeaseToken, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let job = Self::held_job(&mut inner, token)?;
        // Snooze is not an attempt; hand the attempt back.
        job.attempts = job.attempts.saturating_sub(1);
        job.state = JobState::Available;
        job.available_at = until;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn recover_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Running
                && job.lease_expires_at.is_some_and(|expiry| expiry < now)
            {
                job.state = JobState::Available;
                job.available_at = now;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.last_error
                    .get_or_insert_with(|| "lease expired".to_string());
                job.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && matches!(job.state, JobState::Available | JobState::Retryable)
            })
            .count())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRow>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn find_by_hash(&self, repo: RepositoryId, hash: &str) -> Result<Option<AssetRecord>> {
        let inner = self.lock();
        let id = inner.hash_index.get(&(repo, hash.to_string()));
        Ok(id.and_then(|id| inner.assets.get(id)).cloned())
    }

    async fn commit_asset(&self, asset: NewAsset, follow_ups: Vec<NewJob>) -> Result<AssetId> {
        let mut inner = self.lock();
        let key = (asset.repository_id, asset.content_hash.clone());
        if inner.hash_index.contains_key(&key) {
            return Err(CoreError::Conflict(format!(
                "asset with hash {} already exists in repository {}",
                asset.content_hash, asset.repository_id
            )));
        }

        let id = asset.id;
        let record = AssetRecord {
            id,
            repository_id: asset.repository_id,
            path: asset.path,
            size: asset.size,
            content_hash: asset.content_hash,
            mime: asset.mime,
            kind: asset.kind,
            owner: asset.owner,
            uploaded_at: asset.uploaded_at,
            taken_at: asset.taken_at,
            metadata: asset.metadata,
            deleted_at: None,
        };
        inner.assets.insert(id, record);
        inner.hash_index.insert(key, id);
        for job in follow_ups {
            Self::insert_job(&mut inner, job);
        }
        Ok(id)
    }

    async fn attach_metadata(&self, asset: AssetId, metadata: Value) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .assets
            .get_mut(&asset)
            .ok_or_else(|| CoreError::NotFound(format!("asset {asset}")))?;
        merge_metadata(&mut record.metadata, metadata);
        Ok(())
    }

    async fn record_embedding(
        &self,
        asset: AssetId,
        vector: Vec<f32>,
        model_id: &str,
    ) -> Result<()> {
        let dim = vector.len();
        self.attach_metadata(
            asset,
            json!({
                "clip_embedding": { "vector": vector, "dim": dim, "model_id": model_id },
            }),
        )
        .await
    }

    async fn record_labels(
        &self,
        asset: AssetId,
        labels: Vec<ScoredLabel>,
        model_id: &str,
        source: Option<String>,
    ) -> Result<()> {
        self.attach_metadata(
            asset,
            json!({
                "labels": { "entries": labels, "model_id": model_id, "source": source },
            }),
        )
        .await
    }

    async fn get_asset(&self, asset: AssetId) -> Result<Option<AssetRecord>> {
        Ok(self.lock().assets.get(&asset).cloned())
    }

    async fn soft_delete(&self, asset: AssetId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .assets
            .get_mut(&asset)
            .ok_or_else(|| CoreError::NotFound(format!("asset {asset}")))?;
        if record.deleted_at.is_none() {
            record.deleted_at = Some(Utc::now());
            let key = (record.repository_id, record.content_hash.clone());
            inner.hash_index.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl FileRecordStore for MemoryStore {
    async fn batch_upsert(&self, repo: RepositoryId, records: Vec<FileRecord>) -> Result<()> {
        let mut inner = self.lock();
        for record in records {
            debug_assert_eq!(record.repository_id, repo);
            inner
                .files
                .insert((repo, record.rel_path.clone()), record);
        }
        Ok(())
    }

    async fn delete_by_path(&self, repo: RepositoryId, rel_path: &str) -> Result<bool> {
        let mut inner = self.lock();
        Ok(inner.files.remove(&(repo, rel_path.to_string())).is_some())
    }

    async fn list_for_repository(&self, repo: RepositoryId) -> Result<Vec<FileRecord>> {
        let inner = self.lock();
        Ok(inner
            .files
            .values()
            .filter(|record| record.repository_id == repo)
            .cloned()
            .collect())
    }

    async fn get_record(&self, repo: RepositoryId, rel_path: &str) -> Result<Option<FileRecord>> {
        let inner = self.lock();
        Ok(inner.files.get(&(repo, rel_path.to_string())).cloned())
    }
}

#[async_trait]
impl SyncOpStore for MemoryStore {
    async fn open(&self, repo: RepositoryId, kind: SyncOpKind) -> Result<SyncOpId> {
        let mut inner = self.lock();
        let op = SyncOperation {
            id: SyncOpId::new(),
            repository_id: repo,
            kind,
            stats: SyncStats::default(),
            started_at: Utc::now(),
            finished_at: None,
            status: SyncOpStatus::Running,
            error: None,
        };
        let id = op.id;
        inner.sync_ops.push(op);
        Ok(id)
    }

    async fn close(
        &self,
        op: SyncOpId,
        stats: SyncStats,
        status: SyncOpStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let row = inner
            .sync_ops
            .iter_mut()
            .find(|row| row.id == op)
            .ok_or_else(|| CoreError::NotFound(format!("sync operation {op}")))?;
        if row.status != SyncOpStatus::Running {
            return Err(CoreError::Conflict(format!(
                "sync operation {op} already closed"
            )));
        }
        row.stats = stats;
        row.status = status;
        row.error = error;
        row.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn latest_for_repository(&self, repo: RepositoryId) -> Result<Option<SyncOperation>> {
        let inner = self.lock();
        Ok(inner
            .sync_ops
            .iter()
            .rev()
            .find(|row| row.repository_id == repo)
            .cloned())
    }
}

/// Shallow merge: top-level keys of `incoming` overwrite or extend `target`.
fn merge_metadata(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                target.insert(key, value);
            }
        }
        (target, incoming) => {
            if !incoming.is_null() {
                *target = incoming;
            }
        }
    }
}
