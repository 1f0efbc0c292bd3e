//! The `ingest` queue handler: commits staged uploads into the repository.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use luma_model::AssetKind;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::queue::payload::{
    JobPayload, MediaFollowUpJob, ProcessAssetJob, RunInferenceJob,
};
use crate::queue::runtime::{JobContext, JobHandler, JobOutcome};
use crate::repository::{Repository, RepositoryRegistry};
use crate::store::{AssetStore, NewAsset, NewJob};

use super::hash::hash_file;
use super::placer::{Placement, place};
use super::staging::StagingArea;

/// Longest edge of the compact re-encode handed to the inference service.
const INFERENCE_EDGE: u32 = 512;

/// Policy knobs for follow-up fan-out.
#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    /// Whether committed videos get a transcode job in addition to the
    /// metadata probe and thumbnail.
    pub transcode_videos: bool,
}

/// Handler for `ProcessAsset` jobs.
///
/// Deduplicates by content hash, commits the staged file via the placer,
/// creates the asset record, and enqueues the kind-specific follow-ups in
/// the same atomic unit as the record insert.
pub struct AssetProcessor {
    repositories: Arc<RepositoryRegistry>,
    assets: Arc<dyn AssetStore>,
    options: ProcessorOptions,
    /// Serializes placement + move per repository: the existence check in
    /// the placer and the rename must be one step, or two same-named
    /// uploads processed concurrently could clobber at the target path.
    placement_locks: DashMap<luma_model::RepositoryId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for AssetProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetProcessor")
            .field("repositories", &self.repositories)
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl JobHandler for AssetProcessor {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> JobOutcome {
        match payload {
            JobPayload::ProcessAsset(job) => self.process(job).await,
            other => JobOutcome::Fatal {
                error: format!("ingest queue received a {} payload", other.kind()),
            },
        }
    }
}

impl AssetProcessor {
    pub fn new(
        repositories: Arc<RepositoryRegistry>,
        assets: Arc<dyn AssetStore>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            repositories,
            assets,
            options,
            placement_locks: DashMap::new(),
        }
    }

    fn placement_lock(&self, repo: luma_model::RepositoryId) -> Arc<Mutex<()>> {
        Arc::clone(
            &self
                .placement_locks
                .entry(repo)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn process(&self, job: ProcessAssetJob) -> JobOutcome {
        // A vanished staged file can never be recovered by retrying.
        match tokio::fs::metadata(&job.staged_path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => {
                return JobOutcome::Fatal {
                    error: format!("staged path {} is not a file", job.staged_path.display()),
                };
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return JobOutcome::Fatal {
                    error: format!("staged file {} is gone", job.staged_path.display()),
                };
            }
            Err(err) => {
                return JobOutcome::Retry {
                    error: format!("stat on staged file failed: {err}"),
                };
            }
        }

        // The resolver falls back to the default repository when the
        // requested one has vanished; only an empty registry is terminal.
        let repo = match self.repositories.resolve(Some(job.repository_id)) {
            Ok(repo) => repo,
            Err(err) => {
                return JobOutcome::Fatal {
                    error: err.to_string(),
                };
            }
        };

        match self.commit(&repo, &job).await {
            Ok(()) => JobOutcome::Completed,
            Err(err) => {
                // A terminal failure parks the staged file under `failed/`
                // for inspection until the sweep collects it.
                if !err.is_retryable() {
                    let staging = StagingArea::new(Arc::clone(&repo));
                    if let Err(park_err) = staging.quarantine(&job.staged_path).await {
                        warn!(
                            staging_id = %job.staging_id,
                            error = %park_err,
                            "failed to quarantine staged file"
                        );
                    }
                }
                JobOutcome::from_error(&err)
            }
        }
    }

    async fn commit(&self, repo: &Arc<Repository>, job: &ProcessAssetJob) -> Result<()> {
        let staging = StagingArea::new(Arc::clone(repo));

        // The server-computed hash is authoritative; a client hash is only
        // a hint.
        let content_hash = hash_file(&job.staged_path).await?;
        if let Some(client_hash) = &job.client_hash
            && !client_hash.eq_ignore_ascii_case(&content_hash)
        {
            warn!(
                staging_id = %job.staging_id,
                client_hash,
                server_hash = %content_hash,
                "client-supplied hash disagrees with server hash; server wins"
            );
        }

        if let Some(existing) = self
            .assets
            .find_by_hash(repo.id, &content_hash)
            .await?
        {
            return self.complete_duplicate(&staging, job, existing.id).await;
        }

        let kind = classify(&job.content_type, &job.file_name);
        let size = tokio::fs::metadata(&job.staged_path).await?.len();

        let rel_path = {
            let lock = self.placement_lock(repo.id);
            let _placing = lock.lock().await;
            let placement = place(repo, &job.file_name, &content_hash, job.uploaded_at).await?;
            match placement {
                Placement::Target(rel) => {
                    staging
                        .commit(&job.staged_path, &repo.absolute(&rel))
                        .await?;
                    rel
                }
                // The bytes already live at their content-addressed path
                // (for example after a crash between move and record
                // insert); only the record is missing.
                Placement::ExistingContent(rel) => {
                    staging.discard(&job.staged_path).await?;
                    rel
                }
            }
        };

        let asset_id = luma_model::AssetId::new();
        let follow_ups = self.follow_ups(repo, job, asset_id, kind, &rel_path).await;
        let asset = NewAsset {
            id: asset_id,
            repository_id: repo.id,
            path: rel_path.clone(),
            size,
            content_hash: content_hash.clone(),
            mime: job.content_type.clone(),
            kind,
            owner: job.owner.clone(),
            uploaded_at: job.uploaded_at,
            taken_at: None,
            metadata: json!({ "original_name": job.file_name }),
        };

        match self.assets.commit_asset(asset, follow_ups).await {
            Ok(asset_id) => {
                info!(
                    asset = %asset_id,
                    repository = %repo.id,
                    path = rel_path,
                    kind = %kind,
                    "asset committed"
                );
                Ok(())
            }
            // A parallel ingest of the same content won the record race.
            // Re-enter the dedup branch; our inbox copy is redundant unless
            // the winner landed on the same path.
            Err(CoreError::Conflict(_)) => {
                let existing = self
                    .assets
                    .find_by_hash(repo.id, &content_hash)
                    .await?
                    .ok_or_else(|| {
                        CoreError::Internal(
                            "conflicting asset vanished during dedup re-entry".into(),
                        )
                    })?;
                if existing.path != rel_path {
                    staging.discard(&repo.absolute(&rel_path)).await?;
                }
                debug!(
                    asset = %existing.id,
                    repository = %repo.id,
                    "concurrent ingest of identical content; kept the winner"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn complete_duplicate(
        &self,
        staging: &StagingArea,
        job: &ProcessAssetJob,
        existing: luma_model::AssetId,
    ) -> Result<()> {
        staging.discard(&job.staged_path).await?;
        self.assets
            .attach_metadata(
                existing,
                json!({
                    "last_duplicate_upload": {
                        "file_name": job.file_name,
                        "uploaded_at": job.uploaded_at,
                        "owner": job.owner,
                    },
                }),
            )
            .await?;
        info!(asset = %existing, staging_id = %job.staging_id, "duplicate upload deduplicated");
        Ok(())
    }

    async fn follow_ups(
        &self,
        repo: &Arc<Repository>,
        job: &ProcessAssetJob,
        asset_id: luma_model::AssetId,
        kind: AssetKind,
        rel_path: &str,
    ) -> Vec<NewJob> {
        let media_job = || MediaFollowUpJob {
            asset_id,
            repository_id: repo.id,
            path: rel_path.to_string(),
        };

        match kind {
            AssetKind::Photo => {
                let mut jobs = Vec::new();
                match prepare_inference_payload(&repo.absolute(rel_path)).await {
                    Ok(image) => jobs.push(NewJob::new(JobPayload::RunInference(
                        RunInferenceJob {
                            asset_id,
                            repository_id: repo.id,
                            image,
                            mime: "image/jpeg".into(),
                        },
                    ))),
                    Err(err) => {
                        warn!(
                            staging_id = %job.staging_id,
                            error = %err,
                            "could not prepare inference payload; skipping inference"
                        );
                    }
                }
                jobs.push(NewJob::new(JobPayload::GenerateThumbnail(media_job())));
                jobs
            }
            AssetKind::Video => {
                let mut jobs = vec![
                    NewJob::new(JobPayload::ProbeMetadata(media_job())),
                    NewJob::new(JobPayload::GenerateThumbnail(media_job())),
                ];
                if self.options.transcode_videos {
                    jobs.push(NewJob::new(JobPayload::TranscodeVideo(media_job())));
                }
                jobs
            }
            AssetKind::Audio => vec![
                NewJob::new(JobPayload::ProbeMetadata(media_job())),
                NewJob::new(JobPayload::GenerateWaveform(media_job())),
            ],
            AssetKind::Other => Vec::new(),
        }
    }
}

/// MIME-prefix classification with an extension heuristic for uploads that
/// arrived without a usable content type.
fn classify(content_type: &str, file_name: &str) -> AssetKind {
    let by_mime = AssetKind::from_mime(content_type);
    if by_mime != AssetKind::Other {
        return by_mime;
    }
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(AssetKind::from_extension)
        .unwrap_or(AssetKind::Other)
}

/// Decode the committed photo and re-encode a compact JPEG for the model:
/// longest edge bounded, RGB.
async fn prepare_inference_payload(path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let decoded = image::ImageReader::open(&path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| CoreError::Corrupt(format!("image decode failed: {e}")))?;
        let compact = decoded.thumbnail(INFERENCE_EDGE, INFERENCE_EDGE).into_rgb8();
        let mut out = Cursor::new(Vec::new());
        compact
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(|e| CoreError::Internal(format!("image encode failed: {e}")))?;
        Ok(out.into_inner())
    })
    .await
    .map_err(|e| CoreError::Internal(format!("inference payload task failed: {e}")))?
}
