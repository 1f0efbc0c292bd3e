//! Two-tier filesystem synchronization: an event-driven watcher for the
//! hot path and a scheduled full-walk reconciler as the safety net.

pub mod debounce;
pub mod filter;
pub mod orchestrator;
pub mod reconciler;
pub mod watcher;

pub use filter::IgnoreRules;
pub use orchestrator::{SyncOrchestrator, SyncStatus};
pub use reconciler::Reconciler;
pub use watcher::WatchService;
