//! Per-repository storage policies, read from configuration on startup.

use serde::{Deserialize, Serialize};

/// Where committed files land inside the inbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategy {
    /// `inbox/<YYYY>/<MM>/<name>`, dated by ingest time.
    #[default]
    Date,
    /// `inbox/<name>`.
    Flat,
    /// `inbox/<h0h1>/<h2h3>/<h4h5>/<hash><ext>`, sharded by content hash.
    Cas,
}

/// How a name collision at the target path is resolved when a *different*
/// file already occupies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Append a fresh opaque id to the basename.
    #[default]
    Uuid,
    /// Append an incrementing integer to the basename.
    Rename,
    /// Replace the existing file.
    Overwrite,
}

/// Repository-level knobs, one set per managed media root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub storage_strategy: StorageStrategy,
    pub handle_duplicate_filenames: DuplicatePolicy,
    /// Hard cap for a single upload in bytes. 0 means unbounded.
    pub max_file_size: u64,
    /// Glob patterns excluded from watching and reconciliation.
    pub ignore_patterns: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            storage_strategy: StorageStrategy::default(),
            handle_duplicate_filenames: DuplicatePolicy::default(),
            max_file_size: 0,
            ignore_patterns: Vec::new(),
        }
    }
}
