//! Canonical asset records and kind classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AssetId, RepositoryId};

/// Coarse media kind, derived from the MIME type at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Photo,
    Video,
    Audio,
    Other,
}

impl AssetKind {
    /// Classify by MIME prefix. Unknown or empty types map to `Other`.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim();
        if mime.starts_with("image/") {
            AssetKind::Photo
        } else if mime.starts_with("video/") {
            AssetKind::Video
        } else if mime.starts_with("audio/") {
            AssetKind::Audio
        } else {
            AssetKind::Other
        }
    }

    /// Heuristic fallback for uploads that arrive without a content type.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "tiff" | "tif"
            | "bmp" | "dng" | "cr2" | "cr3" | "nef" | "arw" | "raf" | "orf" => AssetKind::Photo,
            "mp4" | "mov" | "mkv" | "avi" | "webm" | "m4v" | "mts" | "m2ts" | "3gp" => {
                AssetKind::Video
            }
            "mp3" | "flac" | "wav" | "aac" | "ogg" | "opus" | "m4a" | "wma" | "aiff" => {
                AssetKind::Audio
            }
            _ => AssetKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Photo => "photo",
            AssetKind::Video => "video",
            AssetKind::Audio => "audio",
            AssetKind::Other => "other",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One label with its classifier confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredLabel {
    pub label: String,
    pub score: f32,
}

/// The canonical, deduplicated representation of a stored media file.
///
/// `(repository_id, content_hash)` is the dedup key: at most one non-deleted
/// record exists per pair. `path` is relative to the repository root and the
/// file exists there when the record is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: AssetId,
    pub repository_id: RepositoryId,
    /// Final in-repo path, relative to the repository root.
    pub path: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub content_hash: String,
    pub mime: String,
    pub kind: AssetKind,
    pub owner: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    /// Capture timestamp when known (EXIF etc.), otherwise None.
    pub taken_at: Option<DateTime<Utc>>,
    /// Kind-specific metadata payload, merged by sub-processors.
    #[serde(default)]
    pub metadata: Value,
    /// Soft-delete marker; a deleted record frees the dedup key.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AssetRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
