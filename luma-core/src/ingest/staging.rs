//! Filesystem scratch space for in-flight uploads.
//!
//! Layout inside a repository root:
//! `.luma/staging/incoming/<staging_id><ext>` for in-flight uploads and
//! `.luma/staging/failed/<staging_id><ext>` for terminally-failed ingests
//! awaiting collection. Staged files are owned exclusively by this area
//! until they are committed (an atomic rename into the inbox) or collected
//! by the orphan sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use luma_model::{StagedFile, StagingId};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StagingConfig;
use crate::error::{CoreError, Result};
use crate::repository::Repository;

const WRITE_CHUNK: usize = 64 * 1024;

/// The staging area of one repository.
#[derive(Debug, Clone)]
pub struct StagingArea {
    repository: Arc<Repository>,
}

impl StagingArea {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    /// Create the incoming/failed directories if missing.
    pub async fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.repository.staging_incoming()).await?;
        fs::create_dir_all(self.repository.staging_failed()).await?;
        Ok(())
    }

    /// Stream an upload into a fresh staging file. The write is capped at
    /// `max_size` bytes (0 = unbounded) and fsynced before close. On any
    /// failure the partial file is removed and nothing is left behind.
    pub async fn stage<R>(
        &self,
        file_name: &str,
        content_type: &str,
        client_hash: Option<String>,
        mut reader: R,
        max_size: u64,
    ) -> Result<StagedFile>
    where
        R: AsyncRead + Unpin,
    {
        let id = StagingId::new();
        let path = self
            .repository
            .staging_incoming()
            .join(format!("{id}{}", extension_suffix(file_name)));

        let size = match self.write_capped(&path, &mut reader, max_size).await {
            Ok(size) => size,
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&path).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove partial staging file");
                }
                return Err(err);
            }
        };

        debug!(staging_id = %id, size, path = %path.display(), "upload staged");
        Ok(StagedFile {
            id,
            path,
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            created_at: Utc::now(),
            repository_id: self.repository.id,
            client_hash,
            size,
        })
    }

    async fn write_capped<R>(&self, path: &Path, reader: &mut R, max_size: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = fs::File::create(path).await?;
        let mut buf = vec![0u8; WRITE_CHUNK];
        let mut written: u64 = 0;
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            written += read as u64;
            if max_size > 0 && written > max_size {
                return Err(CoreError::Policy(format!(
                    "upload exceeds the {max_size} byte limit"
                )));
            }
            file.write_all(&buf[..read]).await?;
        }
        file.sync_all().await?;
        Ok(written)
    }

    /// Move a staged file to its final inbox path. Prefers same-filesystem
    /// rename semantics; falls back to copy + fsync + remove when the
    /// rename is not possible.
    pub async fn commit(&self, staged_path: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(staged_path, dest).await {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                debug!(
                    from = %staged_path.display(),
                    to = %dest.display(),
                    error = %rename_err,
                    "rename failed, falling back to copy"
                );
                fs::copy(staged_path, dest).await?;
                let dest_file = fs::File::open(dest).await?;
                dest_file.sync_all().await?;
                fs::remove_file(staged_path).await?;
                Ok(())
            }
        }
    }

    /// Remove a staged file, tolerating one that is already gone.
    pub async fn discard(&self, staged_path: &Path) -> Result<()> {
        match fs::remove_file(staged_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Park a terminally-failed staged file under `failed/` for inspection
    /// until the sweep collects it. A staged file that is already gone
    /// (consumed or discarded earlier) is not an error.
    pub async fn quarantine(&self, staged_path: &Path) -> Result<()> {
        let name = staged_path
            .file_name()
            .ok_or_else(|| CoreError::Internal("staged path has no file name".into()))?;
        let dest = self.repository.staging_failed().join(name);
        fs::create_dir_all(self.repository.staging_failed()).await?;
        match fs::rename(staged_path, &dest).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete staged files older than `max_age` from both the incoming and
    /// failed directories. Live ingestions are never affected: ids are
    /// unique and an in-flight upload is younger than any sane threshold.
    pub async fn sweep_orphans(&self, max_age: Duration) -> Result<u64> {
        let mut removed = 0;
        for dir in [
            self.repository.staging_incoming(),
            self.repository.staging_failed(),
        ] {
            removed += sweep_dir(&dir, max_age).await?;
        }
        Ok(removed)
    }

    /// Periodic orphan collection until cancelled.
    pub fn spawn_gc(&self, config: StagingConfig, cancel: CancellationToken) -> JoinHandle<()> {
        let area = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.gc_interval()) => {}
                }
                match area.sweep_orphans(config.orphan_max_age()).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        debug!(repository = %area.repository.id, removed, "staging orphans collected");
                    }
                    Err(err) => {
                        warn!(repository = %area.repository.id, error = %err, "staging sweep failed");
                    }
                }
            }
        })
    }
}

async fn sweep_dir(dir: &Path, max_age: Duration) -> Result<u64> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok());
        if age.is_some_and(|age| age > max_age) {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "orphan removal failed");
                }
            }
        }
    }
    Ok(removed)
}

/// `".jpg"` for `"cat.jpg"`, empty for extension-less names.
fn extension_suffix(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}
