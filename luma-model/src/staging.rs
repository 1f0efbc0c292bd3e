//! Staged upload descriptors.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RepositoryId, StagingId};

/// A byte blob captured from a client upload, awaiting processing.
///
/// Owned exclusively by the staging area until it is either committed into
/// the inbox (an atomic rename that invalidates the staging id) or garbage
/// collected past the orphan age threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    pub id: StagingId,
    /// Absolute path, strictly under the repository's staging root. The id
    /// is reflected in the file name so paths are self-describing.
    pub path: PathBuf,
    /// File name as declared by the client.
    pub file_name: String,
    /// Content type as declared by the client; `"unknown"` when missing.
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub repository_id: RepositoryId,
    /// Client-supplied content hash. A hint only; the server recomputes.
    pub client_hash: Option<String>,
    pub size: u64,
}
