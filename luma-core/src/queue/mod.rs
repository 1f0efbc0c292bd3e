//! Durable multi-queue job execution.
//!
//! [`payload`] defines the typed work items and the queues they run on;
//! [`runtime`] drives registered workers against a [`JobStore`]
//! (crate::store::JobStore) with leases, retries, and drain-on-shutdown.

pub mod payload;
pub mod runtime;

pub use payload::{JobKind, JobPayload, MediaFollowUpJob, ProcessAssetJob, RunInferenceJob};
pub use runtime::{
    JobContext, JobHandler, JobOutcome, QueueRuntime, QueueSnapshot, QueueSnapshotEntry,
};
