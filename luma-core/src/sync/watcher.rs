//! Real-time filesystem watching per repository.
//!
//! A thin wrapper around `notify` that bridges raw notifications onto a
//! tokio channel, debounces them per path, and applies the collapsed events
//! against the file record store. Notifier-level failures (kernel queue
//! overflow, unsupported filesystem) degrade the repository: the
//! orchestrator is told to run an immediate reconciliation as the safety
//! net.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use luma_model::{FileRecord, RepositoryId};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::error::{CoreError, Result};
use crate::ingest::hash::hash_file;
use crate::repository::Repository;
use crate::store::FileRecordStore;

use super::debounce::{Debouncer, PendingAction};
use super::filter::IgnoreRules;

/// Dispatches debounced filesystem notifications into file records.
pub struct WatchService {
    config: WatchConfig,
    records: Arc<dyn FileRecordStore>,
    /// Repositories whose notifier failed; receivers schedule an immediate
    /// reconciliation.
    degraded_tx: mpsc::Sender<RepositoryId>,
    repositories: Arc<RwLock<HashMap<RepositoryId, RepositoryWatch>>>,
}

impl fmt::Debug for WatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WatchService");
        debug.field("config", &self.config);
        match self.repositories.try_read() {
            Ok(guard) => {
                debug.field("repository_count", &guard.len());
            }
            Err(_) => {
                debug.field("repositories", &"<locked>");
            }
        }
        debug.finish()
    }
}

struct RepositoryWatch {
    watcher: Option<RecommendedWatcher>,
    event_task: JoinHandle<()>,
}

impl RepositoryWatch {
    fn shutdown(self) {
        self.event_task.abort();
        // Dropping the watcher stops the notify stream.
    }
}

impl fmt::Debug for RepositoryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryWatch")
            .field("watcher_active", &self.watcher.is_some())
            .field("event_task_finished", &self.event_task.is_finished())
            .finish()
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

impl WatchService {
    pub fn new(
        config: WatchConfig,
        records: Arc<dyn FileRecordStore>,
        degraded_tx: mpsc::Sender<RepositoryId>,
    ) -> Self {
        Self {
            config,
            records,
            degraded_tx,
            repositories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attach a recursive notify watcher to the repository root. Idempotent
    /// per repository id.
    pub async fn watch(&self, repository: Arc<Repository>) -> Result<()> {
        {
            let guard = self.repositories.read().await;
            if guard.contains_key(&repository.id) {
                return Ok(());
            }
        }

        let (tx, rx) = mpsc::channel::<WatchMessage>(self.config.channel_capacity.max(64));
        let event_task = tokio::spawn(event_loop(
            Arc::clone(&repository),
            Arc::clone(&self.records),
            rx,
            self.config.clone(),
            self.degraded_tx.clone(),
        ));

        let mut guard = self.repositories.write().await;
        if guard.contains_key(&repository.id) {
            event_task.abort();
            return Ok(());
        }
        guard.insert(
            repository.id,
            RepositoryWatch {
                watcher: None,
                event_task,
            },
        );
        drop(guard);

        let repositories = Arc::clone(&self.repositories);
        let degraded_tx = self.degraded_tx.clone();
        let root = repository.root.clone();
        let repo_id = repository.id;
        tokio::spawn(async move {
            let built = spawn_blocking(move || init_watcher(&root, tx)).await;
            match built {
                Ok(Ok(watcher)) => {
                    let mut guard = repositories.write().await;
                    if let Some(entry) = guard.get_mut(&repo_id) {
                        entry.watcher = Some(watcher);
                    }
                }
                Ok(Err(err)) => {
                    warn!(repository = %repo_id, error = %err, "watcher initialization failed");
                    let mut guard = repositories.write().await;
                    if let Some(entry) = guard.remove(&repo_id) {
                        entry.shutdown();
                    }
                    drop(guard);
                    let _ = degraded_tx.send(repo_id).await;
                }
                Err(join_err) => {
                    warn!(repository = %repo_id, error = %join_err, "watcher initialization panicked");
                    let mut guard = repositories.write().await;
                    if let Some(entry) = guard.remove(&repo_id) {
                        entry.shutdown();
                    }
                    drop(guard);
                    let _ = degraded_tx.send(repo_id).await;
                }
            }
        });

        Ok(())
    }

    /// Stop watching the repository.
    pub async fn unwatch(&self, repository_id: RepositoryId) {
        if let Some(watch) = self.repositories.write().await.remove(&repository_id) {
            watch.shutdown();
        }
    }

    /// Whether a live watcher is attached for the repository.
    pub async fn is_watching(&self, repository_id: RepositoryId) -> bool {
        self.repositories.read().await.contains_key(&repository_id)
    }

    /// Tear down all watchers.
    pub async fn shutdown(&self) {
        let mut guard = self.repositories.write().await;
        let watches: Vec<_> = guard.drain().map(|(_, watch)| watch).collect();
        drop(guard);
        for watch in watches {
            watch.shutdown();
        }
    }
}

fn init_watcher(root: &std::path::Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let callback_tx = tx;
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                // A closed channel means the event loop is gone; nothing to
                // deliver to.
                let _ = callback_tx.blocking_send(WatchMessage::Event(event));
            }
            Err(err) => {
                let _ = callback_tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        CoreError::Internal(format!(
            "failed to create watcher for {}: {err}",
            root.display()
        ))
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| {
            CoreError::Internal(format!("failed to watch {}: {err}", root.display()))
        })?;
    Ok(watcher)
}

async fn event_loop(
    repository: Arc<Repository>,
    records: Arc<dyn FileRecordStore>,
    mut rx: mpsc::Receiver<WatchMessage>,
    config: WatchConfig,
    degraded_tx: mpsc::Sender<RepositoryId>,
) {
    let rules = IgnoreRules::new(&repository.config.ignore_patterns);
    let mut debouncer = Debouncer::new(config.debounce_window());

    loop {
        let idle = debouncer.is_empty();
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                match message {
                    WatchMessage::Event(event) => {
                        ingest_raw_event(&repository, &rules, &mut debouncer, event, &degraded_tx);
                    }
                    WatchMessage::Error(error) => {
                        warn!(repository = %repository.id, error, "notifier error; requesting reconciliation");
                        let _ = degraded_tx.try_send(repository.id);
                    }
                }
            }
            expired = debouncer.next(), if !idle => {
                if let Some((path, action)) = expired {
                    apply_event(&repository, &*records, path, action, &config).await;
                }
            }
        }
    }

    // Flush whatever already quiesced; a mid-burst shutdown is repaired by
    // the next reconciliation.
    while let Some((path, action)) = debouncer.next().await {
        apply_event(&repository, &*records, path, action, &config).await;
    }
}

fn ingest_raw_event(
    repository: &Repository,
    rules: &IgnoreRules,
    debouncer: &mut Debouncer,
    event: Event,
    degraded_tx: &mpsc::Sender<RepositoryId>,
) {
    // Rename reports old then new on platforms that pair them; everything
    // else maps to one action per touched path.
    let actions: Vec<(usize, PendingAction)> = match event.kind {
        EventKind::Create(_) => vec![(0, PendingAction::Upsert)],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            vec![(0, PendingAction::Remove), (1, PendingAction::Upsert)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![(0, PendingAction::Remove)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![(0, PendingAction::Upsert)]
        }
        EventKind::Modify(_) => vec![(0, PendingAction::Upsert)],
        EventKind::Remove(_) => vec![(0, PendingAction::Remove)],
        EventKind::Other => {
            // Notifier-level signal (often overflow): fall back to a scan.
            let _ = degraded_tx.try_send(repository.id);
            return;
        }
        _ => vec![(0, PendingAction::Upsert)],
    };

    for (index, action) in actions {
        let Some(path) = event.paths.get(index) else {
            continue;
        };
        let Some(rel) = repository.relativize(path) else {
            continue;
        };
        if rel.is_empty() || rules.is_ignored(&rel) {
            continue;
        }
        debouncer.record(path.clone(), action);
    }
}

async fn apply_event(
    repository: &Repository,
    records: &dyn FileRecordStore,
    path: PathBuf,
    action: PendingAction,
    config: &WatchConfig,
) {
    let Some(rel) = repository.relativize(&path) else {
        return;
    };

    let result = match action {
        PendingAction::Remove => delete_record(repository, records, &rel).await,
        PendingAction::Upsert => upsert_record(repository, records, &path, &rel, config).await,
    };
    // Per-event errors are logged and skipped; the watcher keeps running
    // and reconciliation repairs any gap.
    if let Err(err) = result {
        warn!(
            repository = %repository.id,
            path = rel,
            error = %err,
            "failed to apply filesystem event"
        );
    }
}

async fn delete_record(
    repository: &Repository,
    records: &dyn FileRecordStore,
    rel: &str,
) -> Result<()> {
    let removed = records.delete_by_path(repository.id, rel).await?;
    if removed {
        debug!(repository = %repository.id, path = rel, "file record removed");
    }
    Ok(())
}

async fn upsert_record(
    repository: &Repository,
    records: &dyn FileRecordStore,
    path: &std::path::Path,
    rel: &str,
    config: &WatchConfig,
) -> Result<()> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        // Vanished between the event and the timer: the create/write burst
        // ended in a delete.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return delete_record(repository, records, rel).await;
        }
        Err(err) => return Err(err.into()),
    };

    // Directories need no record; the recursive watcher already covers
    // their contents.
    if metadata.is_dir() {
        return Ok(());
    }

    let size = metadata.len();
    let mtime: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    let content_hash = if size <= config.hash_size_limit {
        match hash_file(path).await {
            Ok(hash) => Some(hash),
            Err(err) => {
                debug!(path = rel, error = %err, "hash skipped");
                None
            }
        }
    } else {
        None
    };

    records
        .upsert(FileRecord {
            repository_id: repository.id,
            rel_path: rel.to_string(),
            size,
            mtime,
            content_hash,
            last_scanned: Utc::now(),
        })
        .await?;
    debug!(repository = %repository.id, path = rel, size, "file record upserted");
    Ok(())
}
