//! Postgres store backend.
//!
//! One pool-backed service implements every persistence port. Dequeue uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never double-lease a job,
//! and `commit_asset` runs the asset insert and its follow-up job inserts in
//! a single transaction.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use luma_model::{
    AssetId, AssetKind, AssetRecord, FileRecord, JobId, RepositoryId, ScoredLabel, SyncOpId,
    SyncOpKind, SyncOpStatus, SyncOperation, SyncStats,
};
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use tracing::info;

use crate::error::{CoreError, Result};
use crate::queue::payload::JobPayload;

use super::{
    AssetStore, FileRecordStore, JobRow, JobState, JobStore, LeaseToken, LeasedJob, NewAsset,
    NewJob, SyncOpStore,
};

/// Durable store backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgStore {
    /// Create the service and verify database health.
    pub async fn connect(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| CoreError::Internal(format!("store failed Postgres health check: {e}")))?;
        info!("store connected to Postgres");
        Ok(Self { pool })
    }

    /// Create the tables and indexes this store relies on if they are
    /// missing. Idempotent; intended for embedded deployments without an
    /// external migration runner.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_job_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &NewJob,
    ) -> Result<JobId> {
        let id = JobId::new();
        let payload = serde_json::to_value(&job.payload)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, state, attempts, available_at)
            VALUES ($1, $2, $3, 'available', 0, $4)
            "#,
        )
        .bind(id.0)
        .bind(job.payload.queue_name())
        .bind(payload)
        .bind(job.available_at)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id UUID PRIMARY KEY,
    repository_id UUID NOT NULL,
    path TEXT NOT NULL,
    size BIGINT NOT NULL,
    content_hash TEXT NOT NULL,
    mime TEXT NOT NULL,
    kind TEXT NOT NULL,
    owner_id TEXT,
    uploaded_at TIMESTAMPTZ NOT NULL,
    taken_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    deleted_at TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_assets_repo_hash_active
    ON assets (repository_id, content_hash) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    queue TEXT NOT NULL,
    payload JSONB NOT NULL,
    state TEXT NOT NULL,
    attempts SMALLINT NOT NULL DEFAULT 0,
    available_at TIMESTAMPTZ NOT NULL,
    last_error TEXT,
    lease_owner TEXT,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_jobs_ready_dequeue
    ON jobs (queue, available_at, id) WHERE state IN ('available', 'retryable');

CREATE TABLE IF NOT EXISTS file_records (
    repository_id UUID NOT NULL,
    rel_path TEXT NOT NULL,
    size BIGINT NOT NULL,
    mtime TIMESTAMPTZ NOT NULL,
    content_hash TEXT,
    last_scanned TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repository_id, rel_path)
);

CREATE TABLE IF NOT EXISTS sync_operations (
    id UUID PRIMARY KEY,
    repository_id UUID NOT NULL,
    kind TEXT NOT NULL,
    scanned BIGINT NOT NULL DEFAULT 0,
    added BIGINT NOT NULL DEFAULT 0,
    updated BIGINT NOT NULL DEFAULT 0,
    removed BIGINT NOT NULL DEFAULT 0,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    status TEXT NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_operations_repo_started
    ON sync_operations (repository_id, started_at DESC);
"#;

fn asset_from_row(row: &PgRow) -> Result<AssetRecord> {
    let kind: String = row.try_get("kind")?;
    let kind = match kind.as_str() {
        "photo" => AssetKind::Photo,
        "video" => AssetKind::Video,
        "audio" => AssetKind::Audio,
        _ => AssetKind::Other,
    };
    Ok(AssetRecord {
        id: AssetId(row.try_get("id")?),
        repository_id: RepositoryId(row.try_get("repository_id")?),
        path: row.try_get("path")?,
        size: row.try_get::<i64, _>("size")?.max(0) as u64,
        content_hash: row.try_get("content_hash")?,
        mime: row.try_get("mime")?,
        kind,
        owner: row.try_get("owner_id")?,
        uploaded_at: row.try_get("uploaded_at")?,
        taken_at: row.try_get("taken_at")?,
        metadata: row.try_get("metadata")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRow> {
    let payload: Value = row.try_get("payload")?;
    let payload: JobPayload = serde_json::from_value(payload)?;
    let state: String = row.try_get("state")?;
    let state: JobState = state
        .parse()
        .map_err(|e: String| CoreError::Internal(format!("job row decode failed: {e}")))?;
    Ok(JobRow {
        id: JobId(row.try_get("id")?),
        queue: row.try_get("queue")?,
        payload,
        state,
        attempts: row.try_get::<i16, _>("attempts")?.max(0) as u16,
        available_at: row.try_get("available_at")?,
        last_error: row.try_get("last_error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn file_record_from_row(row: &PgRow) -> Result<FileRecord> {
    Ok(FileRecord {
        repository_id: RepositoryId(row.try_get("repository_id")?),
        rel_path: row.try_get("rel_path")?,
        size: row.try_get::<i64, _>("size")?.max(0) as u64,
        mtime: row.try_get("mtime")?,
        content_hash: row.try_get("content_hash")?,
        last_scanned: row.try_get("last_scanned")?,
    })
}

fn sync_op_from_row(row: &PgRow) -> Result<SyncOperation> {
    let kind: String = row.try_get("kind")?;
    let kind = match kind.as_str() {
        "realtime" => SyncOpKind::Realtime,
        "startup" => SyncOpKind::Startup,
        _ => SyncOpKind::Reconciliation,
    };
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "completed" => SyncOpStatus::Completed,
        "failed" => SyncOpStatus::Failed,
        _ => SyncOpStatus::Running,
    };
    Ok(SyncOperation {
        id: SyncOpId(row.try_get("id")?),
        repository_id: RepositoryId(row.try_get("repository_id")?),
        kind,
        stats: SyncStats {
            scanned: row.try_get::<i64, _>("scanned")?.max(0) as u64,
            added: row.try_get::<i64, _>("added")?.max(0) as u64,
            updated: row.try_get::<i64, _>("updated")?.max(0) as u64,
            removed: row.try_get::<i64, _>("removed")?.max(0) as u64,
        },
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status,
        error: row.try_get("error")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let mut tx = self.pool.begin().await?;
        let id = Self::insert_job_tx(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<LeasedJob>> {
        let expires_at = Utc::now() + lease_ttl;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running',
                attempts = attempts + 1,
                lease_owner = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND state IN ('available', 'retryable')
                  AND available_at <= NOW()
                ORDER BY available_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        let token = LeaseToken {
            job_id: job.id,
            worker_id: worker_id.to_string(),
            expires_at,
        };
        Ok(Some(LeasedJob { job, token }))
    }

    async fn complete(&self, token: &LeaseToken) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(token.job_id.0)
        .bind(&token.worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "lease on job {} no longer held by {}",
                token.job_id, token.worker_id
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = match retry_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'retryable',
                        available_at = $3,
                        last_error = $4,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND state = 'running' AND lease_owner = $2
                    "#,
                )
                .bind(token.job_id.0)
                .bind(&token.worker_id)
                .bind(at)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed',
                        last_error = $3,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND state = 'running' AND lease_owner = $2
                    "#,
                )
                .bind(token.job_id.0)
                .bind(&token.worker_id)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "lease on job {} no longer held by {}",
                token.job_id, token.worker_id
            )));
        }
        Ok(())
    }

    async fn snooze(&self, token: &LeaseToken, until: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'available',
                attempts = GREATEST(attempts - 1, 0),
                available_at = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(token.job_id.0)
        .bind(&token.worker_id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "lease on job {} no longer held by {}",
                token.job_id, token.worker_id
            )));
        }
        Ok(())
    }

    async fn recover_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'available',
                available_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE(last_error, 'lease expired'),
                updated_at = NOW()
            WHERE state = 'running' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE queue = $1 AND state IN ('available', 'retryable')
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRow>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl AssetStore for PgStore {
    async fn find_by_hash(&self, repo: RepositoryId, hash: &str) -> Result<Option<AssetRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM assets
            WHERE repository_id = $1 AND content_hash = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(repo.0)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn commit_asset(&self, asset: NewAsset, follow_ups: Vec<NewJob>) -> Result<AssetId> {
        let mut tx = self.pool.begin().await?;
        let id = asset.id;
        let inserted = sqlx::query(
            r#"
            INSERT INTO assets
                (id, repository_id, path, size, content_hash, mime, kind,
                 owner_id, uploaded_at, taken_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id.0)
        .bind(asset.repository_id.0)
        .bind(&asset.path)
        .bind(asset.size.min(i64::MAX as u64) as i64)
        .bind(&asset.content_hash)
        .bind(&asset.mime)
        .bind(asset.kind.as_str())
        .bind(&asset.owner)
        .bind(asset.uploaded_at)
        .bind(asset.taken_at)
        .bind(&asset.metadata)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(CoreError::Conflict(format!(
                    "asset with hash {} already exists in repository {}",
                    asset.content_hash, asset.repository_id
                )));
            }
            return Err(err.into());
        }

        for job in &follow_ups {
            Self::insert_job_tx(&mut tx, job).await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn attach_metadata(&self, asset: AssetId, metadata: Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE assets SET metadata = metadata || $2::jsonb WHERE id = $1
            "#,
        )
        .bind(asset.0)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("asset {asset}")));
        }
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
        let row = sqlx::query("SELECT * FROM assets WHERE id = $1")
            .bind(asset.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn soft_delete(&self, asset: AssetId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE assets SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(asset.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("asset {asset}")));
        }
        Ok(())
    }
}

#[async_trait]
impl FileRecordStore for PgStore {
    async fn batch_upsert(&self, repo: RepositoryId, records: Vec<FileRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO file_records
                    (repository_id, rel_path, size, mtime, content_hash, last_scanned)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (repository_id, rel_path) DO UPDATE
                SET size = EXCLUDED.size,
                    mtime = EXCLUDED.mtime,
                    content_hash = EXCLUDED.content_hash,
                    last_scanned = EXCLUDED.last_scanned
                "#,
            )
            .bind(repo.0)
            .bind(&record.rel_path)
            .bind(record.size.min(i64::MAX as u64) as i64)
            .bind(record.mtime)
            .bind(&record.content_hash)
            .bind(record.last_scanned)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_path(&self, repo: RepositoryId, rel_path: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM file_records WHERE repository_id = $1 AND rel_path = $2",
        )
        .bind(repo.0)
        .bind(rel_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_repository(&self, repo: RepositoryId) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM file_records WHERE repository_id = $1")
            .bind(repo.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_record_from_row).collect()
    }

    async fn get_record(&self, repo: RepositoryId, rel_path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT * FROM file_records WHERE repository_id = $1 AND rel_path = $2",
        )
        .bind(repo.0)
        .bind(rel_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_record_from_row).transpose()
    }
}

#[async_trait]
impl SyncOpStore for PgStore {
    async fn open(&self, repo: RepositoryId, kind: SyncOpKind) -> Result<SyncOpId> {
        let id = SyncOpId::new();
        sqlx::query(
            r#"
            INSERT INTO sync_operations (id, repository_id, kind, started_at, status)
            VALUES ($1, $2, $3, NOW(), 'running')
            "#,
        )
        .bind(id.0)
        .bind(repo.0)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn close(
        &self,
        op: SyncOpId,
        stats: SyncStats,
        status: SyncOpStatus,
        error: Option<String>,
    ) -> Result<()> {
        let status_str = match status {
            SyncOpStatus::Running => "running",
            SyncOpStatus::Completed => "completed",
            SyncOpStatus::Failed => "failed",
        };
        let result = sqlx::query(
            r#"
            UPDATE sync_operations
            SET scanned = $2, added = $3, updated = $4, removed = $5,
                finished_at = NOW(), status = $6, error = $7
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(op.0)
        .bind(stats.scanned.min(i64::MAX as u64) as i64)
        .bind(stats.added.min(i64::MAX as u64) as i64)
        .bind(stats.updated.min(i64::MAX as u64) as i64)
        .bind(stats.removed.min(i64::MAX as u64) as i64)
        .bind(status_str)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "sync operation {op} already closed"
            )));
        }
        Ok(())
    }

    async fn latest_for_repository(&self, repo: RepositoryId) -> Result<Option<SyncOperation>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_operations
            WHERE repository_id = $1
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(repo.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_op_from_row).transpose()
    }
}
