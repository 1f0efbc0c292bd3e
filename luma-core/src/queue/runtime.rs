//! Worker pools over the durable job store.
//!
//! One poll loop per registered queue leases work and fans it out to at most
//! `max_concurrency` concurrent handler tasks. Handlers never touch the
//! store: they return a [`JobOutcome`] and the runtime settles the lease,
//! applying the pool's retry policy. A reaper task periodically resurrects
//! jobs whose lease expired with a crashed or stalled worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, info, warn};
use uuid::Uuid;

use luma_model::JobId;

use crate::config::{QueueConfig, RetryPolicy, WorkerOptions};
use crate::error::CoreError;
use crate::error::Result;
use crate::store::{JobStore, LeasedJob, NewJob};

use super::payload::JobPayload;

/// What a handler reports back for one execution.
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    /// Counted against the retry policy; exhausting attempts is terminal.
    Retry { error: String },
    /// Terminal immediately, regardless of remaining attempts.
    Fatal { error: String },
    /// Back to available after the duration, without consuming an attempt.
    Snooze(Duration),
}

impl JobOutcome {
    /// Map an error to an outcome using the taxonomy's retryability.
    pub fn from_error(err: &CoreError) -> Self {
        if err.is_retryable() {
            JobOutcome::Retry {
                error: err.to_string(),
            }
        } else {
            JobOutcome::Fatal {
                error: err.to_string(),
            }
        }
    }

    /// Collapse a handler result into an outcome.
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => JobOutcome::Completed,
            Err(err) => Self::from_error(&err),
        }
    }
}

/// Execution context passed to handlers. Handlers must observe `cancel`
/// promptly during shutdown.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number for this execution.
    pub attempt: u16,
    pub cancel: CancellationToken,
}

/// A queue worker. One implementation is registered per queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> JobOutcome;
}

struct Registration {
    queue: &'static str,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    inflight: AtomicUsize,
}

/// Per-queue counters at a sampling instant.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueSnapshotEntry {
    pub ready: usize,
    pub inflight: usize,
}

/// Aggregated queue metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

/// Multi-queue scheduler built on a durable [`JobStore`].
pub struct QueueRuntime {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    registrations: std::sync::Mutex<Vec<Arc<Registration>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues: Vec<&str> = self
            .lock_registrations()
            .iter()
            .map(|r| r.queue)
            .collect();
        f.debug_struct("QueueRuntime")
            .field("queues", &queues)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl QueueRuntime {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            registrations: std::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Registration>>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a worker pool for one queue. Call before `start`.
    pub fn register_worker(
        &self,
        queue: &'static str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) {
        self.lock_registrations().push(Arc::new(Registration {
            queue,
            handler,
            options,
            inflight: AtomicUsize::new(0),
        }));
    }

    /// Durable enqueue; the job is visible to workers immediately.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobId> {
        self.store.enqueue(NewJob::new(payload)).await
    }

    /// Durable enqueue that becomes visible after `delay`.
    pub async fn enqueue_delayed(&self, payload: JobPayload, delay: Duration) -> Result<JobId> {
        self.store.enqueue(NewJob::delayed(payload, delay)).await
    }

    /// Spawn the poll loops and the lease reaper.
    pub fn start(&self) {
        let registrations: Vec<Arc<Registration>> = self.lock_registrations().clone();
        for registration in registrations {
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let cancel = self.cancel.clone();
            let tracker = self.tracker.clone();
            self.tracker.spawn(run_pool(
                store,
                registration,
                config,
                cancel,
                tracker,
            ));
        }

        let store = Arc::clone(&self.store);
        let interval = self.config.reaper_interval();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }
                match store.recover_expired_leases().await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered, "re-queued jobs with expired leases"),
                    Err(err) => warn!(error = %err, "lease recovery failed"),
                }
            }
        });
    }

    /// Cancel worker contexts and drain in-flight jobs up to the shutdown
    /// grace period. Jobs that do not return in time are left leased; the
    /// next process start recovers them via lease expiry.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        if timeout(self.config.shutdown_grace(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("queue shutdown deadline elapsed with jobs still in flight");
        }
    }

    /// Ready and in-flight counts per registered queue.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let registrations: Vec<Arc<Registration>> = self.lock_registrations().clone();
        let mut queues = HashMap::new();
        for registration in registrations {
            let ready = self.store.queue_depth(registration.queue).await?;
            queues.insert(
                registration.queue.to_string(),
                QueueSnapshotEntry {
                    ready,
                    inflight: registration.inflight.load(Ordering::Relaxed),
                },
            );
        }
        Ok(QueueSnapshot {
            sampled_at: Utc::now(),
            queues,
        })
    }
}

async fn run_pool(
    store: Arc<dyn JobStore>,
    registration: Arc<Registration>,
    config: QueueConfig,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let queue = registration.queue;
    let worker_id = format!("{queue}-{}", Uuid::now_v7().simple());
    let semaphore = Arc::new(Semaphore::new(registration.options.max_concurrency.max(1)));
    debug!(queue, worker_id, "worker pool started");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        let leased = tokio::select! {
            _ = cancel.cancelled() => break,
            leased = store.lease_next(queue, &worker_id, config.lease_ttl()) => leased,
        };

        match leased {
            Ok(Some(leased)) => {
                let store = Arc::clone(&store);
                let registration = Arc::clone(&registration);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    registration.inflight.fetch_add(1, Ordering::Relaxed);
                    execute_leased(store, &registration, leased, cancel).await;
                    registration.inflight.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.poll_interval()) => {}
                }
            }
            Err(err) => {
                drop(permit);
                warn!(queue, error = %err, "dequeue failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.poll_interval()) => {}
                }
            }
        }
    }
    debug!(queue, "worker pool stopped");
}

async fn execute_leased(
    store: Arc<dyn JobStore>,
    registration: &Registration,
    leased: LeasedJob,
    cancel: CancellationToken,
) {
    let queue = registration.queue;
    let job_id = leased.job.id;
    let attempt = leased.job.attempts;
    let ctx = JobContext {
        job_id,
        attempt,
        cancel: cancel.child_token(),
    };
    let span = debug_span!("job", queue, id = %job_id, attempt);

    let handler = Arc::clone(&registration.handler);
    let payload = leased.job.payload.clone();
    let mut task =
        tokio::spawn(async move { handler.handle(ctx, payload).await }.instrument(span));

    // A panicking handler is indistinguishable from a returned error; the
    // join error carries the panic payload as the recorded message.
    let outcome = match registration.options.job_timeout {
        Some(budget) => {
            tokio::select! {
                joined = &mut task => outcome_from_join(joined),
                _ = sleep(budget) => {
                    task.abort();
                    JobOutcome::Retry {
                        error: format!("job exceeded its {budget:?} budget"),
                    }
                }
            }
        }
        None => outcome_from_join(task.await),
    };

    settle(&*store, &leased, outcome, &registration.options.retry).await;
}

fn outcome_from_join(joined: std::result::Result<JobOutcome, tokio::task::JoinError>) -> JobOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => JobOutcome::Retry {
            error: format!("handler panicked: {err}"),
        },
        Err(err) => JobOutcome::Retry {
            error: format!("handler task failed: {err}"),
        },
    }
}

async fn settle(store: &dyn JobStore, leased: &LeasedJob, outcome: JobOutcome, retry: &RetryPolicy) {
    let job_id = leased.job.id;
    let attempt = leased.job.attempts;
    let settled = match outcome {
        JobOutcome::Completed => store.complete(&leased.token).await,
        JobOutcome::Snooze(duration) => {
            let until = Utc::now()
                + chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64);
            store.snooze(&leased.token, until).await
        }
        JobOutcome::Fatal { error } => {
            warn!(id = %job_id, error, "job failed terminally");
            store.fail(&leased.token, &error, None).await
        }
        JobOutcome::Retry { error } => {
            if retry.attempts_exhausted(attempt) {
                warn!(id = %job_id, attempt, error, "job exhausted its attempts");
                store.fail(&leased.token, &error, None).await
            } else {
                let delay = retry.delay_for(attempt);
                debug!(id = %job_id, attempt, ?delay, error, "job scheduled for retry");
                let retry_at = Utc::now()
                    + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
                store.fail(&leased.token, &error, Some(retry_at)).await
            }
        }
    };
    if let Err(err) = settled {
        // A stale lease means the reaper already re-queued the job; the
        // replayed execution must be idempotent anyway.
        warn!(id = %job_id, error = %err, "failed to settle job outcome");
    }
}
