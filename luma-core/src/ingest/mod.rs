//! The upload pipeline: staging, placement, hashing, intake, and the
//! `ProcessAsset` handler that commits staged bytes into the repository.

pub mod followup;
pub mod hash;
pub mod intake;
pub mod placer;
pub mod processor;
pub mod staging;

pub use followup::{FollowUpHandler, LogOnlyProcessor, MediaProcessor};
pub use intake::{IngestReceipt, UNKNOWN_CONTENT_TYPE, UploadIntake, UploadMeta};
pub use placer::{Placement, place};
pub use processor::{AssetProcessor, ProcessorOptions};
pub use staging::StagingArea;
