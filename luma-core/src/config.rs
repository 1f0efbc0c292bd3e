//! Runtime configuration for the core. Every knob has a default; the whole
//! tree deserializes from the environment under the `LUMA` prefix.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Queue runtime knobs shared by all worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long an idle worker sleeps before polling its queue again.
    pub poll_interval_ms: u64,
    /// Lease TTL granted on dequeue; expired leases are re-queued by the
    /// reaper.
    pub lease_ttl_ms: u64,
    /// Cadence of the expired-lease reaper.
    pub reaper_interval_ms: u64,
    /// How long `stop` waits for in-flight jobs before giving up on them.
    pub shutdown_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            lease_ttl_ms: 60_000,
            reaper_interval_ms: 30_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ttl_ms.max(1) as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Bounded-attempt exponential backoff applied to retryable job failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based) runs again: doubles per
    /// failed attempt, capped.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = i32::from(attempt.saturating_sub(1));
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.backoff_max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn attempts_exhausted(&self, attempt: u16) -> bool {
        attempt >= self.max_attempts
    }
}

/// Per-worker-pool registration options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Wall-clock budget for a single job execution, when bounded.
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            retry: RetryPolicy::default(),
            job_timeout: None,
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

/// Inference batch dispatcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Requests per sealed batch. Clamped to at least 1.
    pub batch_size: usize,
    /// How long the dispatcher waits for more requests after the first one.
    /// 0 seals a batch on the first request.
    pub window_ms: u64,
    /// Wall-clock budget for one batch RPC.
    pub rpc_budget_ms: u64,
    /// Submission channel capacity; `submit` blocks when full.
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            window_ms: 1_500,
            rpc_budget_ms: 15_000,
            channel_capacity: 1_024,
        }
    }
}

impl BatchConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn rpc_budget(&self) -> Duration {
        Duration::from_millis(self.rpc_budget_ms.max(1))
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

/// Filesystem watcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Per-path quiescence window before a burst collapses to one event.
    pub debounce_window_ms: u64,
    /// Files above this size are recorded without a content hash.
    pub hash_size_limit: u64,
    /// Raw notification channel capacity per repository.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 500,
            hash_size_limit: 64 * 1024 * 1024,
            channel_capacity: 4_096,
        }
    }
}

impl WatchConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms.max(1))
    }
}

/// Reconciliation scanner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Cadence of scheduled full reconciliations.
    pub interval_ms: u64,
    /// Upsert batch size; one store transaction per batch.
    pub batch_size: usize,
    /// Whether the walk computes content hashes.
    pub hash_files: bool,
    /// Per-file hash budget; a slow file is recorded without a hash.
    pub hash_timeout_ms: u64,
    /// Files above this size are never hashed.
    pub hash_size_limit: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 24 * 60 * 60 * 1_000,
            batch_size: 100,
            hash_files: false,
            hash_timeout_ms: 10_000,
            hash_size_limit: 64 * 1024 * 1024,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn hash_timeout(&self) -> Duration {
        Duration::from_millis(self.hash_timeout_ms.max(1))
    }
}

/// Staging area knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Staged files older than this are orphans and get collected.
    pub orphan_max_age_ms: u64,
    /// Cadence of the orphan sweep.
    pub gc_interval_ms: u64,
    /// Fallback upload size cap applied when the repository sets none.
    pub default_max_upload_size: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            orphan_max_age_ms: 24 * 60 * 60 * 1_000,
            gc_interval_ms: 60 * 60 * 1_000,
            default_max_upload_size: 0,
        }
    }
}

impl StagingConfig {
    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_millis(self.orphan_max_age_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }
}

/// The full core configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub watch: WatchConfig,
    pub reconcile: ReconcileConfig,
    pub staging: StagingConfig,
}

impl CoreConfig {
    /// Load from the process environment: `LUMA_QUEUE__POLL_INTERVAL_MS=250`
    /// style keys override the defaults.
    pub fn from_env() -> Result<Self> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("LUMA").separator("__"))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| CoreError::Internal(format!("configuration load failed: {e}")))
    }
}
