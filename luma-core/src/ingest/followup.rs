//! Trigger seam for the type-specific media processors.
//!
//! The concrete processors (thumbnail rendering, transcoding, metadata
//! probes, waveform extraction) live outside this crate; the core only owns
//! the trigger contract. [`FollowUpHandler`] adapts the queue to a
//! [`MediaProcessor`] implementation, resolving the asset and its on-disk
//! path before handing over.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use luma_model::AssetRecord;
use tracing::debug;

use crate::error::Result;
use crate::queue::payload::{JobKind, JobPayload};
use crate::queue::runtime::{JobContext, JobHandler, JobOutcome};
use crate::repository::RepositoryRegistry;
use crate::store::AssetStore;

/// Contract for the media processors the core fans out to.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn thumbnail(&self, asset: &AssetRecord, path: &Path) -> Result<()>;
    async fn probe(&self, asset: &AssetRecord, path: &Path) -> Result<()>;
    async fn transcode(&self, asset: &AssetRecord, path: &Path) -> Result<()>;
    async fn waveform(&self, asset: &AssetRecord, path: &Path) -> Result<()>;
}

/// Placeholder processor that only logs the trigger. Deployments wire in
/// real processors; the queue contract is identical either way.
#[derive(Debug, Default)]
pub struct LogOnlyProcessor;

#[async_trait]
impl MediaProcessor for LogOnlyProcessor {
    async fn thumbnail(&self, asset: &AssetRecord, path: &Path) -> Result<()> {
        debug!(asset = %asset.id, path = %path.display(), "thumbnail requested");
        Ok(())
    }

    async fn probe(&self, asset: &AssetRecord, path: &Path) -> Result<()> {
        debug!(asset = %asset.id, path = %path.display(), "metadata probe requested");
        Ok(())
    }

    async fn transcode(&self, asset: &AssetRecord, path: &Path) -> Result<()> {
        debug!(asset = %asset.id, path = %path.display(), "transcode requested");
        Ok(())
    }

    async fn waveform(&self, asset: &AssetRecord, path: &Path) -> Result<()> {
        debug!(asset = %asset.id, path = %path.display(), "waveform requested");
        Ok(())
    }
}

/// Queue handler for the thumbnail/transcode/metadata/waveform queues.
pub struct FollowUpHandler {
    repositories: Arc<RepositoryRegistry>,
    assets: Arc<dyn AssetStore>,
    processor: Arc<dyn MediaProcessor>,
}

impl std::fmt::Debug for FollowUpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowUpHandler")
            .field("repositories", &self.repositories)
            .finish()
    }
}

impl FollowUpHandler {
    pub fn new(
        repositories: Arc<RepositoryRegistry>,
        assets: Arc<dyn AssetStore>,
        processor: Arc<dyn MediaProcessor>,
    ) -> Self {
        Self {
            repositories,
            assets,
            processor,
        }
    }
}

#[async_trait]
impl JobHandler for FollowUpHandler {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> JobOutcome {
        let kind = payload.kind();
        let job = match &payload {
            JobPayload::GenerateThumbnail(job)
            | JobPayload::ProbeMetadata(job)
            | JobPayload::TranscodeVideo(job)
            | JobPayload::GenerateWaveform(job) => job,
            other => {
                return JobOutcome::Fatal {
                    error: format!("follow-up queue received a {} payload", other.kind()),
                };
            }
        };

        let asset = match self.assets.get_asset(job.asset_id).await {
            Ok(Some(asset)) => asset,
            Ok(None) => {
                return JobOutcome::Fatal {
                    error: format!("asset {} no longer exists", job.asset_id),
                };
            }
            Err(err) => return JobOutcome::from_error(&err),
        };

        let repo = match self.repositories.resolve(Some(job.repository_id)) {
            Ok(repo) => repo,
            Err(err) => {
                return JobOutcome::Fatal {
                    error: err.to_string(),
                };
            }
        };
        let path = repo.absolute(&job.path);

        let result = match kind {
            JobKind::GenerateThumbnail => self.processor.thumbnail(&asset, &path).await,
            JobKind::ProbeMetadata => self.processor.probe(&asset, &path).await,
            JobKind::TranscodeVideo => self.processor.transcode(&asset, &path).await,
            JobKind::GenerateWaveform => self.processor.waveform(&asset, &path).await,
            // Already filtered above.
            JobKind::ProcessAsset | JobKind::RunInference => unreachable!(),
        };
        JobOutcome::from_result(result)
    }
}
