//! Periodic full diff between the filesystem and the file records.
//!
//! Catches whatever the watcher missed: events dropped during overflow,
//! changes made while the process was down, or records orphaned by external
//! deletions. Every run writes an audit row.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use luma_model::{FileRecord, SyncOpKind, SyncOpStatus, SyncStats};
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::error::Result;
use crate::ingest::hash::hash_file;
use crate::repository::Repository;
use crate::store::{FileRecordStore, SyncOpStore};

use super::filter::IgnoreRules;

/// What the walk observed for one file.
#[derive(Debug, Clone)]
struct DiskEntry {
    size: u64,
    mtime: DateTime<Utc>,
    hash: Option<String>,
}

/// Full-walk comparator between a repository subtree and its records.
pub struct Reconciler {
    records: Arc<dyn FileRecordStore>,
    sync_ops: Arc<dyn SyncOpStore>,
    config: ReconcileConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        records: Arc<dyn FileRecordStore>,
        sync_ops: Arc<dyn SyncOpStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            records,
            sync_ops,
            config,
        }
    }

    /// Run one reconciliation, bracketed by its audit row. Store failures
    /// abort the run and mark the row failed; the next scheduled run
    /// catches up.
    pub async fn reconcile(&self, repository: &Repository, kind: SyncOpKind) -> Result<SyncStats> {
        let op = self.sync_ops.open(repository.id, kind).await?;
        match self.run(repository).await {
            Ok(stats) => {
                self.sync_ops
                    .close(op, stats, SyncOpStatus::Completed, None)
                    .await?;
                info!(
                    repository = %repository.id,
                    scanned = stats.scanned,
                    added = stats.added,
                    updated = stats.updated,
                    removed = stats.removed,
                    "reconciliation completed"
                );
                Ok(stats)
            }
            Err(err) => {
                let close = self
                    .sync_ops
                    .close(
                        op,
                        SyncStats::default(),
                        SyncOpStatus::Failed,
                        Some(err.to_string()),
                    )
                    .await;
                if let Err(close_err) = close {
                    warn!(error = %close_err, "failed to close sync audit row");
                }
                Err(err)
            }
        }
    }

    async fn run(&self, repository: &Repository) -> Result<SyncStats> {
        let rules = IgnoreRules::new(&repository.config.ignore_patterns);
        let disk = self.walk(repository, &rules).await?;

        let mut records: HashMap<String, FileRecord> = self
            .records
            .list_for_repository(repository.id)
            .await?
            .into_iter()
            .map(|record| (record.rel_path.clone(), record))
            .collect();

        let mut stats = SyncStats {
            scanned: disk.len() as u64,
            ..SyncStats::default()
        };

        let now = Utc::now();
        let mut batch: Vec<FileRecord> = Vec::with_capacity(self.config.batch_size());
        for (rel, entry) in &disk {
            let upsert = match records.get(rel) {
                None => {
                    stats.added += 1;
                    true
                }
                Some(record)
                    if record.needs_update(entry.size, entry.mtime, entry.hash.as_deref()) =>
                {
                    stats.updated += 1;
                    true
                }
                Some(_) => false,
            };
            if upsert {
                batch.push(FileRecord {
                    repository_id: repository.id,
                    rel_path: rel.clone(),
                    size: entry.size,
                    mtime: entry.mtime,
                    content_hash: entry.hash.clone(),
                    last_scanned: now,
                });
                if batch.len() >= self.config.batch_size() {
                    self.records
                        .batch_upsert(repository.id, std::mem::take(&mut batch))
                        .await?;
                }
            }
        }
        if !batch.is_empty() {
            self.records.batch_upsert(repository.id, batch).await?;
        }

        // Records with no file behind them are orphans.
        records.retain(|rel, _| !disk.contains_key(rel));
        for rel in records.into_keys() {
            if self.records.delete_by_path(repository.id, &rel).await? {
                stats.removed += 1;
            }
        }

        Ok(stats)
    }

    /// Walk the user-managed subtree. Inaccessible entries and unreadable
    /// subtrees are logged and skipped; the walk itself still completes.
    async fn walk(
        &self,
        repository: &Repository,
        rules: &IgnoreRules,
    ) -> Result<HashMap<String, DiskEntry>> {
        let mut disk = HashMap::new();
        let mut stack: Vec<PathBuf> = vec![repository.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "skipping unreadable subtree");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "directory listing aborted");
                        break;
                    }
                };

                let path = entry.path();
                let Some(rel) = repository.relativize(&path) else {
                    continue;
                };
                if rel.is_empty() || rules.is_ignored(&rel) {
                    continue;
                }

                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        debug!(path = rel, error = %err, "skipping inaccessible entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }

                let size = metadata.len();
                let mtime: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                let hash = self.maybe_hash(&path, size).await;
                disk.insert(rel, DiskEntry { size, mtime, hash });
            }
        }

        Ok(disk)
    }

    async fn maybe_hash(&self, path: &Path, size: u64) -> Option<String> {
        if !self.config.hash_files || size > self.config.hash_size_limit {
            return None;
        }
        match tokio::time::timeout(self.config.hash_timeout(), hash_file(path)).await {
            Ok(Ok(hash)) => Some(hash),
            Ok(Err(err)) => {
                debug!(path = %path.display(), error = %err, "hash failed during walk");
                None
            }
            Err(_) => {
                debug!(path = %path.display(), "hash timed out during walk");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use luma_model::{RepositoryConfig, RepositoryId};

    fn repository(root: &std::path::Path) -> Repository {
        Repository::new(
            RepositoryId::new(),
            root,
            RepositoryConfig {
                ignore_patterns: vec!["*.tmp".to_string()],
                ..RepositoryConfig::default()
            },
        )
    }

    async fn seed_tree(root: &std::path::Path) {
        tokio::fs::create_dir_all(root.join("photos")).await.unwrap();
        tokio::fs::write(root.join("photos/a.jpg"), b"aaa").await.unwrap();
        tokio::fs::write(root.join("photos/b.jpg"), b"bbbb").await.unwrap();
        tokio::fs::write(root.join("ignored.tmp"), b"x").await.unwrap();
        tokio::fs::create_dir_all(root.join(".luma/staging/incoming"))
            .await
            .unwrap();
        tokio::fs::write(root.join(".luma/staging/incoming/y.jpg"), b"y")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_run_adds_all_visible_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path()).await;
        let repo = repository(dir.path());
        let store = Arc::new(MemoryStore::new());
        let reconciler =
            Reconciler::new(store.clone(), store.clone(), ReconcileConfig::default());

        let stats = reconciler
            .reconcile(&repo, SyncOpKind::Startup)
            .await
            .unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.removed, 0);

        // Ignored and system entries never become records.
        assert!(store.get_record(repo.id, "ignored.tmp").await.unwrap().is_none());
        assert!(
            store
                .get_record(repo.id, ".luma/staging/incoming/y.jpg")
                .await
                .unwrap()
                .is_none()
        );

        let op = store.latest_for_repository(repo.id).await.unwrap().unwrap();
        assert_eq!(op.status, SyncOpStatus::Completed);
        assert_eq!(op.kind, SyncOpKind::Startup);
        assert!(op.finished_at.is_some());
    }

    #[tokio::test]
    async fn second_run_on_unchanged_tree_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path()).await;
        let repo = repository(dir.path());
        let store = Arc::new(MemoryStore::new());
        let reconciler =
            Reconciler::new(store.clone(), store.clone(), ReconcileConfig::default());

        reconciler.reconcile(&repo, SyncOpKind::Startup).await.unwrap();
        let stats = reconciler
            .reconcile(&repo, SyncOpKind::Reconciliation)
            .await
            .unwrap();
        assert_eq!(stats.added, 0);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.removed, 0);
    }

    #[tokio::test]
    async fn changed_files_are_updated_and_orphans_removed() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path()).await;
        let repo = repository(dir.path());
        let store = Arc::new(MemoryStore::new());
        let reconciler =
            Reconciler::new(store.clone(), store.clone(), ReconcileConfig::default());
        reconciler.reconcile(&repo, SyncOpKind::Startup).await.unwrap();

        // Grow one file and delete another behind the watcher's back.
        tokio::fs::write(dir.path().join("photos/a.jpg"), b"aaa-grown")
            .await
            .unwrap();
        tokio::fs::remove_file(dir.path().join("photos/b.jpg"))
            .await
            .unwrap();

        let stats = reconciler
            .reconcile(&repo, SyncOpKind::Reconciliation)
            .await
            .unwrap();
        assert_eq!(stats.updated, 1);
        assert!(stats.removed >= 1);
        assert!(store.get_record(repo.id, "photos/b.jpg").await.unwrap().is_none());
        let record = store
            .get_record(repo.id, "photos/a.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.size, b"aaa-grown".len() as u64);
    }

    #[tokio::test]
    async fn missing_root_marks_the_run_completed_with_nothing_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(&dir.path().join("does-not-exist"));
        let store = Arc::new(MemoryStore::new());
        let reconciler =
            Reconciler::new(store.clone(), store.clone(), ReconcileConfig::default());

        // An unreadable root is a skipped subtree, not a failed run.
        let stats = reconciler
            .reconcile(&repo, SyncOpKind::Reconciliation)
            .await
            .unwrap();
        assert_eq!(stats.scanned, 0);
    }

    #[tokio::test]
    async fn hashing_walk_records_content_hashes() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path()).await;
        let repo = repository(dir.path());
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            store.clone(),
            ReconcileConfig {
                hash_files: true,
                ..ReconcileConfig::default()
            },
        );

        reconciler.reconcile(&repo, SyncOpKind::Startup).await.unwrap();
        let record = store
            .get_record(repo.id, "photos/a.jpg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.content_hash.as_deref(),
            Some(crate::ingest::hash::hash_bytes(b"aaa").as_str())
        );
    }
}
