//! End-to-end exercise of the upload pipeline: intake → staging → queue →
//! processor → follow-ups → batched inference, all against the in-memory
//! store and a scripted inference transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use luma_core::config::{BatchConfig, QueueConfig, StagingConfig, WorkerOptions};
use luma_core::inference::proto::{
    EmbeddingResult, InferRequest, InferResponse, LabelsResult, TASK_EMBED,
};
use luma_core::inference::{BatchDispatcher, InferenceTransport, InferenceWorker, ResponseStream};
use luma_core::ingest::{
    AssetProcessor, FollowUpHandler, LogOnlyProcessor, ProcessorOptions, UploadIntake, UploadMeta,
};
use luma_core::queue::payload::{JobKind, JobPayload, ProcessAssetJob};
use luma_core::queue::runtime::{JobContext, JobOutcome, QueueRuntime};
use luma_core::store::{JobState, JobStore, MemoryStore};
use luma_core::{Repository, RepositoryRegistry};
use luma_model::{AssetKind, RepositoryConfig, RepositoryId, ScoredLabel, StagingId};
use tokio_util::sync::CancellationToken;

/// Answers every frame pair with a 512-dim embedding and three labels.
struct ScriptedTransport;

#[async_trait]
impl InferenceTransport for ScriptedTransport {
    async fn infer(&self, requests: Vec<InferRequest>) -> luma_core::Result<ResponseStream> {
        let responses: Vec<luma_core::Result<InferResponse>> = requests
            .iter()
            .map(|request| {
                let (result, meta) = if request.task == TASK_EMBED {
                    (
                        serde_json::to_vec(&EmbeddingResult {
                            vector: vec![0.25; 512],
                            dim: 512,
                            model_id: "clip-vit-b32".into(),
                        })
                        .unwrap(),
                        HashMap::new(),
                    )
                } else {
                    let mut meta = HashMap::new();
                    meta.insert("source".to_string(), "zero_shot".to_string());
                    (
                        serde_json::to_vec(&LabelsResult {
                            labels: vec![
                                ScoredLabel { label: "cat".into(), score: 0.93 },
                                ScoredLabel { label: "pet".into(), score: 0.61 },
                                ScoredLabel { label: "indoors".into(), score: 0.34 },
                            ],
                            model_id: "smart-classify-v2".into(),
                        })
                        .unwrap(),
                        meta,
                    )
                };
                Ok(InferResponse {
                    correlation_id: request.correlation_id.clone(),
                    error: None,
                    result,
                    meta,
                })
            })
            .collect();
        Ok(futures::stream::iter(responses).boxed())
    }
}

fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 10,
        lease_ttl_ms: 10_000,
        reaper_interval_ms: 100,
        shutdown_grace_ms: 5_000,
    }
}

/// A small but real JPEG so the processor can prepare an inference payload.
fn sample_jpeg() -> Vec<u8> {
    let pixels = image::RgbImage::from_fn(64, 48, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 5) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(pixels)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

struct Pipeline {
    store: Arc<MemoryStore>,
    registry: Arc<RepositoryRegistry>,
    intake: UploadIntake,
    runtime: Arc<QueueRuntime>,
    dispatcher: Arc<BatchDispatcher>,
    repo: Arc<Repository>,
}

async fn pipeline(root: &std::path::Path, repo_config: RepositoryConfig) -> Pipeline {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(RepositoryRegistry::new());
    let repo = registry.register(Repository::new(RepositoryId::new(), root, repo_config));

    let intake = UploadIntake::new(registry.clone(), store.clone(), StagingConfig::default());
    let runtime = Arc::new(QueueRuntime::new(store.clone(), fast_queue_config()));

    let dispatcher = Arc::new(BatchDispatcher::spawn(
        Arc::new(ScriptedTransport),
        BatchConfig {
            batch_size: 4,
            window_ms: 50,
            ..BatchConfig::default()
        },
    ));

    runtime.register_worker(
        JobKind::ProcessAsset.queue_name(),
        Arc::new(AssetProcessor::new(
            registry.clone(),
            store.clone(),
            ProcessorOptions::default(),
        )),
        WorkerOptions::with_concurrency(2),
    );
    runtime.register_worker(
        JobKind::RunInference.queue_name(),
        Arc::new(InferenceWorker::new(dispatcher.clone(), store.clone())),
        WorkerOptions::with_concurrency(1),
    );
    let follow_up = Arc::new(FollowUpHandler::new(
        registry.clone(),
        store.clone(),
        Arc::new(LogOnlyProcessor),
    ));
    for kind in [
        JobKind::GenerateThumbnail,
        JobKind::ProbeMetadata,
        JobKind::TranscodeVideo,
        JobKind::GenerateWaveform,
    ] {
        runtime.register_worker(kind.queue_name(), follow_up.clone(), WorkerOptions::with_concurrency(2));
    }
    runtime.start();

    Pipeline {
        store,
        registry,
        intake,
        runtime,
        dispatcher,
        repo,
    }
}

async fn wait_until<F, Fut>(budget: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn staging_is_empty(repo: &Repository) -> bool {
    let incoming = repo.staging_incoming();
    match tokio::fs::read_dir(&incoming).await {
        Ok(mut entries) => entries.next_entry().await.unwrap().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn happy_path_photo_upload_lands_with_embedding_and_labels() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;
    let jpeg = sample_jpeg();

    let receipt = p
        .intake
        .ingest(
            Some(p.repo.id),
            UploadMeta {
                file_name: "cat.jpg".into(),
                content_type: Some("image/jpeg".into()),
                ..UploadMeta::default()
            },
            jpeg.as_slice(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.status, "processing");

    // The processor commits the asset and the inference worker attaches
    // the model results.
    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move {
            store
                .assets_in_repository(repo_id)
                .first()
                .is_some_and(|asset| {
                    asset.metadata.get("clip_embedding").is_some()
                        && asset.metadata.get("labels").is_some()
                })
        }
    })
    .await;

    let assets = p.store.assets_in_repository(p.repo.id);
    assert_eq!(assets.len(), 1);
    let asset = &assets[0];
    assert_eq!(asset.kind, AssetKind::Photo);

    // The inbox file holds exactly the uploaded bytes, at a date path.
    assert!(asset.path.starts_with("inbox/"));
    assert!(asset.path.ends_with("/cat.jpg"));
    let on_disk = tokio::fs::read(p.repo.absolute(&asset.path)).await.unwrap();
    assert_eq!(on_disk, jpeg);

    // Server-side hash matches the stored bytes.
    let expected_hash = luma_core::ingest::hash::hash_bytes(&jpeg);
    assert_eq!(asset.content_hash, expected_hash);

    // Embedding invariant: vector length equals dim; at most 3 labels.
    let embedding = &asset.metadata["clip_embedding"];
    assert_eq!(
        embedding["vector"].as_array().unwrap().len(),
        embedding["dim"].as_u64().unwrap() as usize
    );
    assert_eq!(embedding["dim"].as_u64().unwrap(), 512);
    let labels = asset.metadata["labels"]["entries"].as_array().unwrap();
    assert!(!labels.is_empty() && labels.len() <= 3);
    assert_eq!(asset.metadata["labels"]["source"], "zero_shot");

    // Staging is drained and the follow-up jobs completed.
    assert!(staging_is_empty(&p.repo).await);
    let store = p.store.clone();
    wait_until(Duration::from_secs(5), move || {
        let store = store.clone();
        async move {
            store
                .jobs_in_queue("thumbnail")
                .iter()
                .all(|job| job.state == JobState::Completed)
        }
    })
    .await;

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn duplicate_upload_is_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;
    let jpeg = sample_jpeg();

    let meta = || UploadMeta {
        file_name: "cat.jpg".into(),
        content_type: Some("image/jpeg".into()),
        ..UploadMeta::default()
    };

    let first = p
        .intake
        .ingest(Some(p.repo.id), meta(), jpeg.as_slice())
        .await
        .unwrap();
    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move { store.assets_in_repository(repo_id).len() == 1 }
    })
    .await;

    let second = p
        .intake
        .ingest(Some(p.repo.id), meta(), jpeg.as_slice())
        .await
        .unwrap();
    assert_ne!(first.task_id, second.task_id);

    // The second job completes as a dedup hit: no new asset, no new inbox
    // file, staged copy removed.
    let store = p.store.clone();
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move {
            store
                .get_job(second.task_id)
                .await
                .unwrap()
                .is_some_and(|job| job.state == JobState::Completed)
        }
    })
    .await;

    let assets = p.store.assets_in_repository(p.repo.id);
    assert_eq!(assets.len(), 1);
    assert!(
        assets[0].metadata.get("last_duplicate_upload").is_some(),
        "dedup hit should attach the upload's metadata"
    );
    assert!(staging_is_empty(&p.repo).await);

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn colliding_names_with_uuid_policy_keep_both_files() {
    let dir = tempfile::tempdir().unwrap();
    // Flat layout makes the collision deterministic.
    let p = pipeline(
        dir.path(),
        RepositoryConfig {
            storage_strategy: luma_model::StorageStrategy::Flat,
            ..RepositoryConfig::default()
        },
    )
    .await;

    for content in [&b"first contents"[..], &b"second contents"[..]] {
        p.intake
            .ingest(
                Some(p.repo.id),
                UploadMeta {
                    file_name: "notes.txt".into(),
                    content_type: Some("text/plain".into()),
                    ..UploadMeta::default()
                },
                content,
            )
            .await
            .unwrap();
    }

    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move { store.assets_in_repository(repo_id).len() == 2 }
    })
    .await;

    let assets = p.store.assets_in_repository(p.repo.id);
    let mut paths: Vec<&str> = assets.iter().map(|a| a.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(paths.len(), 2);
    assert_ne!(paths[0], paths[1]);
    assert!(paths.contains(&"inbox/notes.txt"));
    for asset in &assets {
        assert!(
            tokio::fs::try_exists(p.repo.absolute(&asset.path)).await.unwrap(),
            "{} should exist on disk",
            asset.path
        );
    }
    let hashes: std::collections::HashSet<&str> =
        assets.iter().map(|a| a.content_hash.as_str()).collect();
    assert_eq!(hashes.len(), 2);

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn zero_byte_upload_commits_as_other() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;

    p.intake
        .ingest(
            Some(p.repo.id),
            UploadMeta {
                file_name: "empty.bin".into(),
                ..UploadMeta::default()
            },
            &b""[..],
        )
        .await
        .unwrap();

    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move { store.assets_in_repository(repo_id).len() == 1 }
    })
    .await;

    let assets = p.store.assets_in_repository(p.repo.id);
    assert_eq!(assets[0].kind, AssetKind::Other);
    assert_eq!(assets[0].size, 0);
    // "Other" assets fan out to nothing.
    assert!(p.store.jobs_in_queue("inference").is_empty());
    assert!(p.store.jobs_in_queue("thumbnail").is_empty());

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn staged_file_vanishing_before_commit_fails_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(RepositoryRegistry::new());
    let repo = registry.register(Repository::new(
        RepositoryId::new(),
        dir.path(),
        RepositoryConfig::default(),
    ));

    let processor = AssetProcessor::new(registry.clone(), store.clone(), ProcessorOptions::default());
    let job = ProcessAssetJob {
        repository_id: repo.id,
        staging_id: StagingId::new(),
        staged_path: repo.staging_incoming().join("never-existed.jpg"),
        file_name: "never-existed.jpg".into(),
        content_type: "image/jpeg".into(),
        client_hash: None,
        owner: None,
        uploaded_at: chrono::Utc::now(),
    };

    let ctx = JobContext {
        job_id: luma_model::JobId::new(),
        attempt: 1,
        cancel: CancellationToken::new(),
    };
    let outcome = luma_core::queue::runtime::JobHandler::handle(
        &processor,
        ctx,
        JobPayload::ProcessAsset(job),
    )
    .await;

    assert!(matches!(outcome, JobOutcome::Fatal { .. }));
    // No asset row and no inbox file were produced.
    assert!(store.assets_in_repository(repo.id).is_empty());
    assert!(!tokio::fs::try_exists(repo.inbox_root()).await.unwrap());
}

#[tokio::test]
async fn client_hash_mismatch_does_not_block_the_commit() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;

    p.intake
        .ingest(
            Some(p.repo.id),
            UploadMeta {
                file_name: "doc.txt".into(),
                content_type: Some("text/plain".into()),
                client_hash: Some("definitely-not-the-hash".into()),
                ..UploadMeta::default()
            },
            &b"document body"[..],
        )
        .await
        .unwrap();

    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move { store.assets_in_repository(repo_id).len() == 1 }
    })
    .await;

    // The server-computed hash wins.
    let assets = p.store.assets_in_repository(p.repo.id);
    assert_eq!(
        assets[0].content_hash,
        luma_core::ingest::hash::hash_bytes(b"document body")
    );

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn queue_snapshot_reports_registered_queues() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;

    let snapshot = p.runtime.snapshot().await.unwrap();
    for queue in ["ingest", "inference", "thumbnail", "metadata", "transcode", "waveform"] {
        assert!(snapshot.queues.contains_key(queue), "missing queue {queue}");
    }

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}

#[tokio::test]
async fn upload_without_a_repository_uses_the_default() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), RepositoryConfig::default()).await;
    assert_eq!(p.registry.resolve(None).unwrap().id, p.repo.id);

    p.intake
        .ingest(
            None,
            UploadMeta {
                file_name: "anywhere.txt".into(),
                content_type: Some("text/plain".into()),
                ..UploadMeta::default()
            },
            &b"body"[..],
        )
        .await
        .unwrap();

    let store = p.store.clone();
    let repo_id = p.repo.id;
    wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        async move { store.assets_in_repository(repo_id).len() == 1 }
    })
    .await;

    p.runtime.stop().await;
    p.dispatcher.stop().await;
}
