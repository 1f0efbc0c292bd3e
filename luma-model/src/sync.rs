//! Synchronization run audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RepositoryId, SyncOpId};

/// What triggered a synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpKind {
    Realtime,
    Reconciliation,
    Startup,
}

impl SyncOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOpKind::Realtime => "realtime",
            SyncOpKind::Reconciliation => "reconciliation",
            SyncOpKind::Startup => "startup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpStatus {
    Running,
    Completed,
    Failed,
}

/// Counters reported by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub scanned: u64,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

/// Audit row for a synchronization run. Terminal status is set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: SyncOpId,
    pub repository_id: RepositoryId,
    pub kind: SyncOpKind,
    pub stats: SyncStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncOpStatus,
    pub error: Option<String>,
}

impl SyncOperation {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
