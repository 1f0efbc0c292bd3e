//! Coalesces single-asset inference calls into batched streaming RPCs.
//!
//! Exactly one dispatcher task reads the submission channel and drives one
//! in-flight RPC at a time; submitters only ever touch their reply channel.
//! Serializing batches keeps occupancy high on the model side, with latency
//! variance bounded by the batch window.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use luma_model::AssetId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::{CoreError, Result};

use super::client::InferenceTransport;
use super::proto::{
    EmbeddingResult, InferRequest, InferResponse, LabelsResult, TASK_CLASSIFY, TASK_EMBED,
};

/// Correlation-id suffix for the embedding half of a submission.
const SUFFIX_EMBED: &str = "emb";
/// Correlation-id suffix for the classification half.
const SUFFIX_CLASSIFY: &str = "smart";
/// Labels requested per classification.
const CLASSIFY_TOPK: &str = "3";

/// Merged result delivered to one submitter.
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub embedding: EmbeddingResult,
    pub labels: LabelsResult,
    /// Which classification branch produced the labels, when reported.
    pub label_source: Option<String>,
}

/// A live submitter waiting on its result.
struct BatchSlot {
    asset_id: AssetId,
    image: Vec<u8>,
    mime: String,
    reply: oneshot::Sender<Result<InferenceOutcome>>,
}

impl fmt::Debug for BatchSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSlot")
            .field("asset_id", &self.asset_id)
            .field("image_len", &self.image.len())
            .field("mime", &self.mime)
            .finish()
    }
}

/// Aggregates concurrent submissions into windowed batches.
pub struct BatchDispatcher {
    tx: mpsc::Sender<BatchSlot>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl BatchDispatcher {
    /// Spawn the dispatcher task over the given transport.
    pub fn spawn(transport: Arc<dyn InferenceTransport>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(transport, config, rx, cancel.clone()));
        Self {
            tx,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Submit one asset for embedding + classification. Blocks until the
    /// result is available, the batch fails, or the dispatcher stops. The
    /// bounded submission channel provides backpressure: when it is full,
    /// `submit` waits without deadlocking the dispatcher.
    pub async fn submit(
        &self,
        asset_id: AssetId,
        image: Vec<u8>,
        mime: String,
    ) -> Result<InferenceOutcome> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(BatchSlot {
                asset_id,
                image,
                mime,
                reply,
            })
            .await
            .map_err(|_| CoreError::Cancelled("inference dispatcher stopped".into()))?;
        result
            .await
            .map_err(|_| CoreError::Cancelled("inference batch dropped".into()))?
    }

    /// Stop accepting submissions and wait for the in-flight batch.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "inference dispatcher task ended abnormally");
        }
    }
}

async fn dispatch_loop(
    transport: Arc<dyn InferenceTransport>,
    config: BatchConfig,
    mut rx: mpsc::Receiver<BatchSlot>,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size();
    let window = config.window();

    loop {
        // Block for the first request of a batch.
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            slot = rx.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
        };

        let mut batch: Vec<BatchSlot> = Vec::with_capacity(batch_size);
        let mut members: HashSet<AssetId> = HashSet::new();
        push_slot(&mut batch, &mut members, first);

        // Accumulate until the batch fills or the window elapses. A zero
        // window seals immediately on the first request.
        if batch.len() < batch_size && !window.is_zero() {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            while batch.len() < batch_size {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = cancel.cancelled() => break,
                    slot = rx.recv() => match slot {
                        Some(slot) => push_slot(&mut batch, &mut members, slot),
                        None => break,
                    },
                }
            }
        }

        debug!(size = batch.len(), "inference batch sealed");
        process_batch(&*transport, &config, batch).await;
    }
}

/// Correlation ids are unique per batch by construction: a second
/// submission of the same asset id within one batch is rejected up front.
fn push_slot(batch: &mut Vec<BatchSlot>, members: &mut HashSet<AssetId>, slot: BatchSlot) {
    if members.insert(slot.asset_id) {
        batch.push(slot);
    } else {
        let _ = slot.reply.send(Err(CoreError::Conflict(format!(
            "asset {} already queued in this batch",
            slot.asset_id
        ))));
    }
}

struct Pending {
    reply: oneshot::Sender<Result<InferenceOutcome>>,
    embedding: Option<EmbeddingResult>,
    labels: Option<LabelsResult>,
    label_source: Option<String>,
    error: Option<CoreError>,
}

async fn process_batch(
    transport: &dyn InferenceTransport,
    config: &BatchConfig,
    batch: Vec<BatchSlot>,
) {
    let total = (batch.len() * 2) as u32;
    let mut requests = Vec::with_capacity(batch.len() * 2);
    let mut pending: HashMap<AssetId, Pending> = HashMap::with_capacity(batch.len());

    for (index, slot) in batch.into_iter().enumerate() {
        requests.push(InferRequest {
            correlation_id: format!("{}|{SUFFIX_EMBED}", slot.asset_id),
            task: TASK_EMBED.to_string(),
            payload: slot.image.clone(),
            payload_mime: slot.mime.clone(),
            seq: (2 * index) as u32,
            total,
            meta: HashMap::new(),
        });
        let mut meta = HashMap::new();
        meta.insert("topk".to_string(), CLASSIFY_TOPK.to_string());
        requests.push(InferRequest {
            correlation_id: format!("{}|{SUFFIX_CLASSIFY}", slot.asset_id),
            task: TASK_CLASSIFY.to_string(),
            payload: slot.image,
            payload_mime: slot.mime,
            seq: (2 * index + 1) as u32,
            total,
            meta,
        });
        pending.insert(
            slot.asset_id,
            Pending {
                reply: slot.reply,
                embedding: None,
                labels: None,
                label_source: None,
                error: None,
            },
        );
    }

    let expected = pending.len() * 2;
    let stream_failure: Option<String> = match transport.infer(requests).await {
        Err(err) => {
            // Failing to open the stream fails the whole batch identically.
            let message = err.to_string();
            warn!(error = %message, "inference stream could not be opened");
            Some(message)
        }
        Ok(mut stream) => {
            let drain = async {
                let mut received = 0usize;
                while received < expected {
                    match stream.next().await {
                        None => break,
                        Some(Ok(frame)) => {
                            if handle_frame(&mut pending, frame) {
                                received += 1;
                            }
                        }
                        Some(Err(err)) => return Some(err.to_string()),
                    }
                }
                None
            };
            match tokio::time::timeout(config.rpc_budget(), drain).await {
                Ok(failure) => failure,
                Err(_) => Some(format!(
                    "inference batch exceeded its {:?} budget",
                    config.rpc_budget()
                )),
            }
        }
    };

    // Deliver: a per-asset error beats an incomplete pair; submitters whose
    // context went away just drop the send.
    for (asset_id, entry) in pending {
        let outcome = if let Some(error) = entry.error {
            Err(error)
        } else {
            match (entry.embedding, entry.labels) {
                (Some(embedding), Some(labels)) => Ok(InferenceOutcome {
                    embedding,
                    labels,
                    label_source: entry.label_source,
                }),
                _ => Err(match &stream_failure {
                    Some(message) => CoreError::remote("stream", message.clone()),
                    None => CoreError::remote(
                        "incomplete",
                        format!("incomplete inference result for asset {asset_id}"),
                    ),
                }),
            }
        };
        let _ = entry.reply.send(outcome);
    }
}

/// Apply one response frame. Returns whether it counted toward the expected
/// frame total (unknown correlation ids and suffixes do not).
fn handle_frame(pending: &mut HashMap<AssetId, Pending>, frame: InferResponse) -> bool {
    let Some((asset_part, suffix)) = frame.correlation_id.rsplit_once('|') else {
        return false;
    };
    if suffix != SUFFIX_EMBED && suffix != SUFFIX_CLASSIFY {
        return false;
    }
    let Ok(asset_id) = asset_part.parse::<Uuid>().map(AssetId::from) else {
        return false;
    };
    let Some(entry) = pending.get_mut(&asset_id) else {
        return false;
    };

    if let Some(error) = frame.error {
        // A server error on either half fails only this asset; keep the
        // first error seen.
        entry
            .error
            .get_or_insert(CoreError::remote(error.code, error.message));
        return true;
    }

    if suffix == SUFFIX_EMBED {
        match serde_json::from_slice::<EmbeddingResult>(&frame.result) {
            Ok(embedding) if embedding.vector.len() == embedding.dim => {
                entry.embedding = Some(embedding);
            }
            Ok(embedding) => {
                entry.error.get_or_insert(CoreError::Corrupt(format!(
                    "embedding length {} does not match dim {}",
                    embedding.vector.len(),
                    embedding.dim
                )));
            }
            Err(err) => {
                entry
                    .error
                    .get_or_insert(CoreError::Corrupt(format!("embedding decode failed: {err}")));
            }
        }
    } else {
        match serde_json::from_slice::<LabelsResult>(&frame.result) {
            Ok(labels) => {
                entry.labels = Some(labels);
                entry.label_source = frame.meta.get("source").cloned();
            }
            Err(err) => {
                entry
                    .error
                    .get_or_insert(CoreError::Corrupt(format!("labels decode failed: {err}")));
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::client::ResponseStream;
    use async_trait::async_trait;
    use luma_model::ScoredLabel;
    use std::sync::Mutex;

    /// Scripted transport: answers every request pair from a closure and
    /// records the frames each call received.
    struct FakeTransport {
        calls: Mutex<Vec<Vec<InferRequest>>>,
        respond: Box<dyn Fn(&InferRequest) -> Option<InferResponse> + Send + Sync>,
        fail_open: bool,
    }

    impl FakeTransport {
        fn answering() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(default_response),
                fail_open: false,
            })
        }

        fn with(respond: impl Fn(&InferRequest) -> Option<InferResponse> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                fail_open: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(default_response),
                fail_open: true,
            })
        }

        fn call_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    fn default_response(request: &InferRequest) -> Option<InferResponse> {
        let result = if request.task == TASK_EMBED {
            serde_json::to_vec(&EmbeddingResult {
                vector: vec![0.1; 512],
                dim: 512,
                model_id: "clip-test".into(),
            })
            .unwrap()
        } else {
            serde_json::to_vec(&LabelsResult {
                labels: vec![ScoredLabel {
                    label: "cat".into(),
                    score: 0.9,
                }],
                model_id: "classify-test".into(),
            })
            .unwrap()
        };
        let mut meta = HashMap::new();
        if request.task == TASK_CLASSIFY {
            meta.insert("source".to_string(), "zero_shot".to_string());
        }
        Some(InferResponse {
            correlation_id: request.correlation_id.clone(),
            error: None,
            result,
            meta,
        })
    }

    #[async_trait]
    impl InferenceTransport for FakeTransport {
        async fn infer(&self, requests: Vec<InferRequest>) -> Result<ResponseStream> {
            if self.fail_open {
                return Err(CoreError::remote("unavailable", "connection refused"));
            }
            self.calls.lock().unwrap().push(requests.clone());
            let responses: Vec<Result<InferResponse>> = requests
                .iter()
                .filter_map(|request| (self.respond)(request))
                .map(Ok)
                .collect();
            Ok(futures::stream::iter(responses).boxed())
        }
    }

    fn config(batch_size: usize, window_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            window_ms,
            rpc_budget_ms: 2_000,
            channel_capacity: 64,
        }
    }

    #[tokio::test]
    async fn single_submission_gets_a_merged_result() {
        let transport = FakeTransport::answering();
        let dispatcher = BatchDispatcher::spawn(transport.clone(), config(1, 0));

        let outcome = dispatcher
            .submit(AssetId::new(), vec![1, 2, 3], "image/jpeg".into())
            .await
            .unwrap();
        assert_eq!(outcome.embedding.vector.len(), outcome.embedding.dim);
        assert_eq!(outcome.labels.labels.len(), 1);
        assert_eq!(outcome.label_source.as_deref(), Some("zero_shot"));
        assert_eq!(transport.call_sizes(), vec![2]);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn window_seals_a_partial_batch() {
        let transport = FakeTransport::answering();
        let dispatcher =
            Arc::new(BatchDispatcher::spawn(transport.clone(), config(3, 200)));

        let a = Arc::clone(&dispatcher);
        let first = tokio::spawn(async move {
            a.submit(AssetId::new(), vec![1], "image/jpeg".into()).await
        });
        let b = Arc::clone(&dispatcher);
        let second = tokio::spawn(async move {
            b.submit(AssetId::new(), vec![2], "image/jpeg".into()).await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // Two requests, silence afterwards: one RPC carrying 2x2 frames.
        assert_eq!(transport.call_sizes(), vec![4]);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn full_batch_seals_without_waiting_for_the_window() {
        let transport = FakeTransport::answering();
        let dispatcher =
            Arc::new(BatchDispatcher::spawn(transport.clone(), config(2, 60_000)));

        let a = Arc::clone(&dispatcher);
        let first = tokio::spawn(async move {
            a.submit(AssetId::new(), vec![1], "image/jpeg".into()).await
        });
        let b = Arc::clone(&dispatcher);
        let second = tokio::spawn(async move {
            b.submit(AssetId::new(), vec![2], "image/jpeg".into()).await
        });

        let (first, second) = tokio::join!(first, second);
        first.unwrap().unwrap();
        second.unwrap().unwrap();
        assert_eq!(transport.call_sizes(), vec![4]);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn per_asset_server_error_fails_only_that_asset() {
        let failing_asset = AssetId::new();
        let failing = failing_asset.to_string();
        let transport = FakeTransport::with(move |request| {
            if request.correlation_id.starts_with(&failing)
                && request.task == TASK_CLASSIFY
            {
                Some(InferResponse {
                    correlation_id: request.correlation_id.clone(),
                    error: Some(super::super::proto::InferError {
                        code: "model_error".into(),
                        message: "classifier fell over".into(),
                    }),
                    result: Vec::new(),
                    meta: HashMap::new(),
                })
            } else {
                default_response(request)
            }
        });
        let dispatcher = Arc::new(BatchDispatcher::spawn(transport, config(2, 500)));

        let healthy_asset = AssetId::new();
        let a = Arc::clone(&dispatcher);
        let failing_task = tokio::spawn(async move {
            a.submit(failing_asset, vec![1], "image/jpeg".into()).await
        });
        let b = Arc::clone(&dispatcher);
        let healthy_task = tokio::spawn(async move {
            b.submit(healthy_asset, vec![2], "image/jpeg".into()).await
        });

        let failed = failing_task.await.unwrap().unwrap_err();
        assert!(matches!(failed, CoreError::Remote { .. }));
        healthy_task.await.unwrap().unwrap();

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn missing_half_surfaces_an_incomplete_result() {
        let transport = FakeTransport::with(|request| {
            if request.task == TASK_CLASSIFY {
                None
            } else {
                default_response(request)
            }
        });
        let dispatcher = BatchDispatcher::spawn(transport, config(1, 0));

        let err = dispatcher
            .submit(AssetId::new(), vec![1], "image/jpeg".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("incomplete"));

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn failure_to_open_the_stream_fails_the_whole_batch() {
        let dispatcher = BatchDispatcher::spawn(FakeTransport::broken(), config(1, 0));
        let err = dispatcher
            .submit(AssetId::new(), vec![1], "image/jpeg".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Remote { .. }));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn embedding_dim_mismatch_is_rejected() {
        let transport = FakeTransport::with(|request| {
            if request.task == TASK_EMBED {
                Some(InferResponse {
                    correlation_id: request.correlation_id.clone(),
                    error: None,
                    result: serde_json::to_vec(&EmbeddingResult {
                        vector: vec![0.1; 10],
                        dim: 512,
                        model_id: "clip-test".into(),
                    })
                    .unwrap(),
                    meta: HashMap::new(),
                })
            } else {
                default_response(request)
            }
        });
        let dispatcher = BatchDispatcher::spawn(transport, config(1, 0));

        let err = dispatcher
            .submit(AssetId::new(), vec![1], "image/jpeg".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn unknown_correlation_suffixes_are_ignored() {
        let transport = FakeTransport::with(|request| {
            if request.task == TASK_EMBED {
                // Mangle the suffix; the dispatcher must not count it.
                let mut frame = default_response(request).unwrap();
                frame.correlation_id = format!(
                    "{}|mystery",
                    frame.correlation_id.rsplit_once('|').unwrap().0
                );
                Some(frame)
            } else {
                default_response(request)
            }
        });
        let dispatcher = BatchDispatcher::spawn(transport, config(1, 0));

        let err = dispatcher
            .submit(AssetId::new(), vec![1], "image/jpeg".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("incomplete"));

        dispatcher.stop().await;
    }
}
