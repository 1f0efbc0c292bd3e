//! Typed job payloads and the queues they run on.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use luma_model::{AssetId, RepositoryId, StagingId};
use serde::{Deserialize, Serialize};

/// Distinguishes the background work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ProcessAsset,
    RunInference,
    GenerateThumbnail,
    TranscodeVideo,
    ProbeMetadata,
    GenerateWaveform,
}

impl JobKind {
    /// The durable queue a job of this kind is enqueued on.
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::ProcessAsset => "ingest",
            JobKind::RunInference => "inference",
            JobKind::GenerateThumbnail => "thumbnail",
            JobKind::TranscodeVideo => "transcode",
            JobKind::ProbeMetadata => "metadata",
            JobKind::GenerateWaveform => "waveform",
        }
    }

    pub const ALL: [JobKind; 6] = [
        JobKind::ProcessAsset,
        JobKind::RunInference,
        JobKind::GenerateThumbnail,
        JobKind::TranscodeVideo,
        JobKind::ProbeMetadata,
        JobKind::GenerateWaveform,
    ];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Structured payload per job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    ProcessAsset(ProcessAssetJob),
    RunInference(RunInferenceJob),
    GenerateThumbnail(MediaFollowUpJob),
    TranscodeVideo(MediaFollowUpJob),
    ProbeMetadata(MediaFollowUpJob),
    GenerateWaveform(MediaFollowUpJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ProcessAsset(_) => JobKind::ProcessAsset,
            JobPayload::RunInference(_) => JobKind::RunInference,
            JobPayload::GenerateThumbnail(_) => JobKind::GenerateThumbnail,
            JobPayload::TranscodeVideo(_) => JobKind::TranscodeVideo,
            JobPayload::ProbeMetadata(_) => JobKind::ProbeMetadata,
            JobPayload::GenerateWaveform(_) => JobKind::GenerateWaveform,
        }
    }

    pub fn queue_name(&self) -> &'static str {
        self.kind().queue_name()
    }
}

/// Commit a staged upload into the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessAssetJob {
    pub repository_id: RepositoryId,
    pub staging_id: StagingId,
    /// Absolute staged path at enqueue time.
    pub staged_path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub client_hash: Option<String>,
    pub owner: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Run image understanding for one committed photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInferenceJob {
    pub asset_id: AssetId,
    pub repository_id: RepositoryId,
    /// Compact re-encode of the photo prepared for the model.
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
    pub mime: String,
}

/// Trigger payload shared by the type-specific media processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFollowUpJob {
    pub asset_id: AssetId,
    pub repository_id: RepositoryId,
    /// Committed in-repo path, relative to the repository root.
    pub path: String,
}

/// Compact serde representation for binary payload fields.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_maps_to_queue() {
        let payload = JobPayload::GenerateThumbnail(MediaFollowUpJob {
            asset_id: AssetId::new(),
            repository_id: RepositoryId::new(),
            path: "inbox/2024/10/cat.jpg".into(),
        });
        assert_eq!(payload.kind(), JobKind::GenerateThumbnail);
        assert_eq!(payload.queue_name(), "thumbnail");
    }

    #[test]
    fn inference_payload_roundtrips_binary_data() {
        let payload = JobPayload::RunInference(RunInferenceJob {
            asset_id: AssetId::new(),
            repository_id: RepositoryId::new(),
            image: vec![0, 1, 2, 254, 255],
            mime: "image/jpeg".into(),
        });
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: JobPayload = serde_json::from_str(&encoded).unwrap();
        match decoded {
            JobPayload::RunInference(job) => assert_eq!(job.image, vec![0, 1, 2, 254, 255]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
