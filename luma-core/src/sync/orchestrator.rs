//! Ownership of the repositories under sync.
//!
//! Starts one watcher per repository, reconciles on registration and on a
//! fixed schedule, and turns watcher degradation into immediate
//! reconciliations. Runs independently of the job queue.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use luma_model::{RepositoryId, SyncOpKind, SyncOperation, SyncStats};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{ReconcileConfig, WatchConfig};
use crate::error::{CoreError, Result};
use crate::repository::{Repository, RepositoryRegistry};
use crate::store::{FileRecordStore, SyncOpStore};

use super::reconciler::Reconciler;
use super::watcher::WatchService;

/// How long shutdown waits for in-flight reconciliations.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Sync health of one repository.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub repository_id: RepositoryId,
    pub watching: bool,
    pub last_operation: Option<SyncOperation>,
}

/// Owns watchers and the reconciliation schedule for all repositories.
pub struct SyncOrchestrator {
    repositories: Arc<RepositoryRegistry>,
    watcher: Arc<WatchService>,
    reconciler: Arc<Reconciler>,
    sync_ops: Arc<dyn SyncOpStore>,
    config: ReconcileConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Repositories with a reconciliation currently in flight.
    in_flight: Arc<Mutex<HashSet<RepositoryId>>>,
    degraded_rx: Mutex<Option<mpsc::Receiver<RepositoryId>>>,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("repositories", &self.repositories)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl SyncOrchestrator {
    pub fn new(
        repositories: Arc<RepositoryRegistry>,
        records: Arc<dyn FileRecordStore>,
        sync_ops: Arc<dyn SyncOpStore>,
        watch_config: WatchConfig,
        reconcile_config: ReconcileConfig,
    ) -> Self {
        let (degraded_tx, degraded_rx) = mpsc::channel(64);
        let watcher = Arc::new(WatchService::new(
            watch_config,
            Arc::clone(&records),
            degraded_tx,
        ));
        let reconciler = Arc::new(Reconciler::new(
            records,
            Arc::clone(&sync_ops),
            reconcile_config.clone(),
        ));
        Self {
            repositories,
            watcher,
            reconciler,
            sync_ops,
            config: reconcile_config,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            degraded_rx: Mutex::new(Some(degraded_rx)),
        }
    }

    /// Spawn the reconciliation schedule and the degraded-watcher listener.
    pub fn start(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(orchestrator.config.interval()) => {}
                }
                for repository in orchestrator.repositories.list() {
                    orchestrator.spawn_reconcile(repository, SyncOpKind::Reconciliation);
                }
            }
        });

        let degraded_rx = self
            .degraded_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut degraded_rx) = degraded_rx {
            let orchestrator = Arc::clone(self);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                loop {
                    let repository_id = tokio::select! {
                        _ = cancel.cancelled() => break,
                        id = degraded_rx.recv() => match id {
                            Some(id) => id,
                            None => break,
                        },
                    };
                    info!(repository = %repository_id, "watcher degraded; reconciling now");
                    if let Some(repository) = orchestrator.repositories.get(repository_id) {
                        orchestrator.spawn_reconcile(repository, SyncOpKind::Reconciliation);
                    }
                }
            });
        }
    }

    /// Register a repository: start its watcher and run the initial scan.
    pub async fn add_repository(self: &Arc<Self>, repository: Repository) -> Result<Arc<Repository>> {
        let repository = self.repositories.register(repository);
        self.watcher.watch(Arc::clone(&repository)).await?;
        self.spawn_reconcile(Arc::clone(&repository), SyncOpKind::Startup);
        info!(repository = %repository.id, root = %repository.root.display(), "repository under sync");
        Ok(repository)
    }

    /// Stop watching and forget the repository. Records are kept; removing
    /// a repository is not a data deletion.
    pub async fn remove_repository(&self, repository_id: RepositoryId) {
        self.watcher.unwatch(repository_id).await;
        self.repositories.remove(repository_id);
    }

    /// Run a reconciliation now and wait for its stats.
    pub async fn trigger_reconciliation(&self, repository_id: RepositoryId) -> Result<SyncStats> {
        let repository = self
            .repositories
            .get(repository_id)
            .ok_or_else(|| CoreError::NotFound(format!("repository {repository_id}")))?;
        self.guarded_reconcile(&repository, SyncOpKind::Reconciliation)
            .await
    }

    pub async fn status(&self, repository_id: RepositoryId) -> Result<SyncStatus> {
        if self.repositories.get(repository_id).is_none() {
            return Err(CoreError::NotFound(format!("repository {repository_id}")));
        }
        Ok(SyncStatus {
            repository_id,
            watching: self.watcher.is_watching(repository_id).await,
            last_operation: self.sync_ops.latest_for_repository(repository_id).await?,
        })
    }

    /// Stop watchers, cancel the schedule, and wait for in-flight runs.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.watcher.shutdown().await;
        self.tracker.close();
        if timeout(SHUTDOWN_WAIT, self.tracker.wait()).await.is_err() {
            warn!("sync shutdown deadline elapsed with reconciliations in flight");
        }
    }

    fn spawn_reconcile(self: &Arc<Self>, repository: Arc<Repository>, kind: SyncOpKind) {
        let orchestrator = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Err(err) = orchestrator.guarded_reconcile(&repository, kind).await {
                match err {
                    CoreError::Conflict(_) => {}
                    err => {
                        warn!(repository = %repository.id, error = %err, "reconciliation failed");
                    }
                }
            }
        });
    }

    /// At most one reconciliation per repository at a time.
    async fn guarded_reconcile(
        &self,
        repository: &Arc<Repository>,
        kind: SyncOpKind,
    ) -> Result<SyncStats> {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(repository.id) {
                return Err(CoreError::Conflict(format!(
                    "reconciliation already running for repository {}",
                    repository.id
                )));
            }
        }
        let result = self.reconciler.reconcile(repository, kind).await;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&repository.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use luma_model::{RepositoryConfig, SyncOpStatus};

    fn orchestrator(store: Arc<MemoryStore>) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(
            Arc::new(RepositoryRegistry::new()),
            store.clone(),
            store,
            WatchConfig {
                debounce_window_ms: 50,
                ..WatchConfig::default()
            },
            ReconcileConfig::default(),
        ))
    }

    #[tokio::test]
    async fn add_repository_runs_the_initial_scan_and_watches() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"abc").await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        orchestrator.start();

        let repo = orchestrator
            .add_repository(Repository::new(
                RepositoryId::new(),
                dir.path().canonicalize().unwrap(),
                RepositoryConfig::default(),
            ))
            .await
            .unwrap();

        // The startup scan runs in the background; wait for its audit row.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(op) = store.latest_for_repository(repo.id).await.unwrap()
                && op.status == SyncOpStatus::Completed
            {
                assert_eq!(op.kind, SyncOpKind::Startup);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "startup scan never completed");
            sleep(Duration::from_millis(25)).await;
        }

        let status = orchestrator.status(repo.id).await.unwrap();
        assert!(status.watching);
        assert!(store.get_record(repo.id, "a.jpg").await.unwrap().is_some());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_reconciliation_reports_stats_and_unknown_repos_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.jpg"), b"abc").await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let repo = orchestrator
            .add_repository(Repository::new(
                RepositoryId::new(),
                dir.path().canonicalize().unwrap(),
                RepositoryConfig::default(),
            ))
            .await
            .unwrap();

        // Wait out the startup scan so the manual trigger does not collide
        // with it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.latest_for_repository(repo.id).await.unwrap()
            .is_none_or(|op| op.status == SyncOpStatus::Running)
        {
            assert!(tokio::time::Instant::now() < deadline);
            sleep(Duration::from_millis(25)).await;
        }

        let stats = orchestrator.trigger_reconciliation(repo.id).await.unwrap();
        assert_eq!(stats.scanned, 1);

        let missing = orchestrator
            .trigger_reconciliation(RepositoryId::new())
            .await;
        assert!(matches!(missing, Err(CoreError::NotFound(_))));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn removed_repository_is_no_longer_watched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let repo = orchestrator
            .add_repository(Repository::new(
                RepositoryId::new(),
                dir.path().canonicalize().unwrap(),
                RepositoryConfig::default(),
            ))
            .await
            .unwrap();

        orchestrator.remove_repository(repo.id).await;
        assert!(matches!(
            orchestrator.status(repo.id).await,
            Err(CoreError::NotFound(_))
        ));

        orchestrator.shutdown().await;
    }
}
