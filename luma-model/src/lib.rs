//! Shared vocabulary types for the Luma media server.
//!
//! This crate holds the strongly typed ids, records, and per-repository
//! policies exchanged between the ingestion core, the stores, and any outer
//! surface. It deliberately contains no I/O.

pub mod asset;
pub mod files;
pub mod ids;
pub mod repository;
pub mod staging;
pub mod sync;

pub use asset::{AssetKind, AssetRecord, ScoredLabel};
pub use files::FileRecord;
pub use ids::{AssetId, JobId, RepositoryId, StagingId, SyncOpId};
pub use repository::{DuplicatePolicy, RepositoryConfig, StorageStrategy};
pub use staging::StagedFile;
pub use sync::{SyncOpKind, SyncOpStatus, SyncOperation, SyncStats};
