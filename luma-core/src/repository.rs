//! Repositories under management and their on-disk layout.

use std::fmt;
use std::sync::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use luma_model::{RepositoryConfig, RepositoryId};

use crate::error::{CoreError, Result};

/// Name of the protected system subtree inside every repository root. It is
/// never watched, never reconciled, and never surfaced as user content.
pub const SYSTEM_DIR: &str = ".luma";

/// A managed media root plus its storage policies.
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: RepositoryId,
    /// Absolute root on disk.
    pub root: PathBuf,
    pub config: RepositoryConfig,
}

impl Repository {
    pub fn new(id: RepositoryId, root: impl Into<PathBuf>, config: RepositoryConfig) -> Self {
        Self {
            id,
            root: root.into(),
            config,
        }
    }

    pub fn system_root(&self) -> PathBuf {
        self.root.join(SYSTEM_DIR)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.system_root().join("staging")
    }

    pub fn staging_incoming(&self) -> PathBuf {
        self.staging_root().join("incoming")
    }

    pub fn staging_failed(&self) -> PathBuf {
        self.staging_root().join("failed")
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.root.join("inbox")
    }

    /// Absolute path for a repository-relative path.
    pub fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Repository-relative form of an absolute path inside this root, with
    /// `/` separators. None if the path escapes the root.
    pub fn relativize(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let mut out = String::new();
        for component in rel.components() {
            let seg = component.as_os_str().to_str()?;
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(seg);
        }
        Some(out)
    }
}

/// In-process registry of the repositories the core operates on. Populated
/// from persisted repository rows on startup; the first registered
/// repository becomes the default unless one is pinned explicitly.
pub struct RepositoryRegistry {
    repositories: DashMap<RepositoryId, Arc<Repository>>,
    default_id: Mutex<Option<RepositoryId>>,
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field("repository_count", &self.repositories.len())
            .field("default_id", &self.default_id())
            .finish()
    }
}

impl Default for RepositoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self {
            repositories: DashMap::new(),
            default_id: Mutex::new(None),
        }
    }

    pub fn register(&self, repository: Repository) -> Arc<Repository> {
        let id = repository.id;
        let repository = Arc::new(repository);
        self.repositories.insert(id, Arc::clone(&repository));
        let mut default = self.lock_default();
        if default.is_none() {
            *default = Some(id);
        }
        drop(default);
        repository
    }

    pub fn remove(&self, id: RepositoryId) -> Option<Arc<Repository>> {
        let removed = self.repositories.remove(&id).map(|(_, repo)| repo);
        if removed.is_some() {
            let mut default = self.lock_default();
            if *default == Some(id) {
                *default = self.repositories.iter().next().map(|entry| *entry.key());
            }
        }
        removed
    }

    pub fn get(&self, id: RepositoryId) -> Option<Arc<Repository>> {
        self.repositories.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub fn set_default(&self, id: RepositoryId) -> Result<()> {
        if !self.repositories.contains_key(&id) {
            return Err(CoreError::NotFound(format!("repository {id}")));
        }
        *self.lock_default() = Some(id);
        Ok(())
    }

    fn lock_default(&self) -> std::sync::MutexGuard<'_, Option<RepositoryId>> {
        self.default_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_id(&self) -> Option<RepositoryId> {
        *self.lock_default()
    }

    pub fn default_repository(&self) -> Option<Arc<Repository>> {
        let id = self.default_id()?;
        self.get(id)
    }

    /// Resolve an optional caller-specified repository, falling back to the
    /// default when none is given or the given one has vanished.
    pub fn resolve(&self, id: Option<RepositoryId>) -> Result<Arc<Repository>> {
        if let Some(id) = id
            && let Some(repo) = self.get(id)
        {
            return Ok(repo);
        }
        self.default_repository()
            .ok_or_else(|| CoreError::NotFound("no repository available".into()))
    }

    pub fn list(&self) -> Vec<Arc<Repository>> {
        self.repositories
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
