//! File records for user-managed directories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RepositoryId;

/// One row describing a file under a repository's user-managed directories.
///
/// `(repository_id, rel_path)` is unique. Maintained in real time by the
/// watcher and repaired by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub repository_id: RepositoryId,
    /// Path relative to the repository root, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Content hash as of the last scan, when hashing was enabled and the
    /// file was under the size threshold.
    pub content_hash: Option<String>,
    pub last_scanned: DateTime<Utc>,
}

impl FileRecord {
    /// Whether `self` (the stored row) is stale relative to what a scan just
    /// observed on disk. Size or mtime drift always wins; hashes only decide
    /// when both sides have one.
    pub fn needs_update(&self, size: u64, mtime: DateTime<Utc>, hash: Option<&str>) -> bool {
        if self.size != size {
            return true;
        }
        // Stores round-trip timestamps at microsecond precision; compare at
        // millisecond granularity so a lossless upsert is not seen as drift.
        if self.mtime.timestamp_millis() != mtime.timestamp_millis() {
            return true;
        }
        match (self.content_hash.as_deref(), hash) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}
