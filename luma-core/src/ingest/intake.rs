//! Upload intake: byte stream in, staged file plus queued job out.
//!
//! The transport layer (out of this crate) hands over a reader and the
//! request metadata; intake stages the bytes and enqueues a `ProcessAsset`
//! job. Processing never happens inline, so the caller gets its task id
//! back as soon as the bytes are durable.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use luma_model::{JobId, RepositoryId, StagingId};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::config::StagingConfig;
use crate::error::Result;
use crate::queue::payload::{JobPayload, ProcessAssetJob};
use crate::repository::RepositoryRegistry;
use crate::store::{JobStore, NewJob};

use super::staging::StagingArea;

/// Sentinel recorded when the client declared no content type. The
/// processor falls back to extension heuristics for classification.
pub const UNKNOWN_CONTENT_TYPE: &str = "unknown";

/// Request metadata accompanying one uploaded file.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub file_name: String,
    pub content_type: Option<String>,
    /// Client-computed content hash; a hint only, the server recomputes.
    pub client_hash: Option<String>,
    pub owner: Option<String>,
}

/// Acknowledgement returned to the upload caller.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    /// The queued job's id, surfaced as the task id.
    pub task_id: JobId,
    pub staging_id: StagingId,
    pub file_name: String,
    pub size: u64,
    pub content_hash: Option<String>,
    pub status: &'static str,
}

/// Turns incoming byte streams into staged files plus queued work.
pub struct UploadIntake {
    repositories: Arc<RepositoryRegistry>,
    jobs: Arc<dyn JobStore>,
    config: StagingConfig,
}

impl fmt::Debug for UploadIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadIntake")
            .field("repositories", &self.repositories)
            .field("config", &self.config)
            .finish()
    }
}

impl UploadIntake {
    pub fn new(
        repositories: Arc<RepositoryRegistry>,
        jobs: Arc<dyn JobStore>,
        config: StagingConfig,
    ) -> Self {
        Self {
            repositories,
            jobs,
            config,
        }
    }

    /// Stage one upload and enqueue its processing job.
    ///
    /// On success exactly one staging file and one durable job exist. On
    /// failure (aborted stream, size cap, storage trouble) neither does.
    pub async fn ingest<R>(
        &self,
        repository: Option<RepositoryId>,
        meta: UploadMeta,
        reader: R,
    ) -> Result<IngestReceipt>
    where
        R: AsyncRead + Unpin,
    {
        let repo = self.repositories.resolve(repository)?;
        let max_size = if repo.config.max_file_size > 0 {
            repo.config.max_file_size
        } else {
            self.config.default_max_upload_size
        };
        let content_type = meta
            .content_type
            .as_deref()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or(UNKNOWN_CONTENT_TYPE)
            .to_string();

        let staging = StagingArea::new(Arc::clone(&repo));
        staging.ensure_layout().await?;
        let staged = staging
            .stage(
                &meta.file_name,
                &content_type,
                meta.client_hash.clone(),
                reader,
                max_size,
            )
            .await?;

        let payload = JobPayload::ProcessAsset(ProcessAssetJob {
            repository_id: repo.id,
            staging_id: staged.id,
            staged_path: staged.path.clone(),
            file_name: staged.file_name.clone(),
            content_type,
            client_hash: meta.client_hash.clone(),
            owner: meta.owner,
            uploaded_at: Utc::now(),
        });

        let task_id = match self.jobs.enqueue(NewJob::new(payload)).await {
            Ok(id) => id,
            Err(err) => {
                // No job means nothing will ever consume the staged file.
                if let Err(cleanup) = staging.discard(&staged.path).await {
                    warn!(path = %staged.path.display(), error = %cleanup, "failed to discard staged file");
                }
                return Err(err);
            }
        };

        debug!(
            task_id = %task_id,
            staging_id = %staged.id,
            repository = %repo.id,
            size = staged.size,
            "upload accepted"
        );
        Ok(IngestReceipt {
            task_id,
            staging_id: staged.id,
            file_name: staged.file_name,
            size: staged.size,
            content_hash: meta.client_hash,
            status: "processing",
        })
    }

    /// Stage a multi-part upload. Parts are independent: one failing part
    /// neither aborts nor rolls back the others.
    pub async fn ingest_batch<R>(
        &self,
        repository: Option<RepositoryId>,
        parts: Vec<(UploadMeta, R)>,
    ) -> Vec<Result<IngestReceipt>>
    where
        R: AsyncRead + Unpin,
    {
        let mut results = Vec::with_capacity(parts.len());
        for (meta, reader) in parts {
            results.push(self.ingest(repository, meta, reader).await);
        }
        results
    }
}
