//! The `inference` queue handler.
//!
//! The queue runs this worker with a concurrency cap of 1 by default, so the
//! dispatcher's submission channel fills from a steady stream of jobs and
//! batch occupancy stays high.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::queue::payload::JobPayload;
use crate::queue::runtime::{JobContext, JobHandler, JobOutcome};
use crate::store::AssetStore;

use super::dispatcher::BatchDispatcher;

/// Executes `RunInference` jobs by submitting to the batch dispatcher and
/// persisting the merged result onto the asset.
pub struct InferenceWorker {
    dispatcher: Arc<BatchDispatcher>,
    assets: Arc<dyn AssetStore>,
}

impl std::fmt::Debug for InferenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceWorker")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl InferenceWorker {
    pub fn new(dispatcher: Arc<BatchDispatcher>, assets: Arc<dyn AssetStore>) -> Self {
        Self { dispatcher, assets }
    }
}

#[async_trait]
impl JobHandler for InferenceWorker {
    async fn handle(&self, _ctx: JobContext, payload: JobPayload) -> JobOutcome {
        let job = match payload {
            JobPayload::RunInference(job) => job,
            other => {
                return JobOutcome::Fatal {
                    error: format!("inference queue received a {} payload", other.kind()),
                };
            }
        };

        let outcome = match self
            .dispatcher
            .submit(job.asset_id, job.image, job.mime)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return JobOutcome::from_error(&err),
        };

        debug!(
            asset = %job.asset_id,
            dim = outcome.embedding.dim,
            labels = outcome.labels.labels.len(),
            source = outcome.label_source.as_deref().unwrap_or("unreported"),
            "inference result received"
        );

        if let Err(err) = self
            .assets
            .record_embedding(
                job.asset_id,
                outcome.embedding.vector,
                &outcome.embedding.model_id,
            )
            .await
        {
            return JobOutcome::from_error(&err);
        }
        if let Err(err) = self
            .assets
            .record_labels(
                job.asset_id,
                outcome.labels.labels,
                &outcome.labels.model_id,
                outcome.label_source,
            )
            .await
        {
            return JobOutcome::from_error(&err);
        }
        JobOutcome::Completed
    }
}
