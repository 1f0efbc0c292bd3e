//! Ingestion and background-processing core for the Luma media server.
//!
//! The crate wires five pieces together:
//!
//! - [`ingest`]: staging → commit → asset record pipeline for uploads,
//! - [`queue`]: durable multi-queue job execution with leases and retries,
//! - [`inference`]: windowed batching over a bidirectional streaming RPC,
//! - [`sync`]: real-time watcher plus scheduled reconciliation,
//! - [`store`]: the persistence ports (Postgres and in-memory backends).
//!
//! The HTTP surface, the concrete media processors, and the model service
//! live outside this crate; only their contracts appear here.

pub mod config;
pub mod error;
pub mod ingest;
pub mod inference;
pub mod queue;
pub mod repository;
pub mod store;
pub mod sync;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use repository::{Repository, RepositoryRegistry, SYSTEM_DIR};
