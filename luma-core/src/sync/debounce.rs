//! Per-path debouncing of filesystem event bursts.
//!
//! Editors and OS tools emit create+write+chmod bursts for one semantic
//! action. Each path gets one pending timer; every new raw event re-arms it
//! and overwrites the pending action, so a burst collapses to the last
//! observed operation once the path goes quiet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::time::delay_queue::{DelayQueue, Key};

/// The collapsed action to apply once a path quiesces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Upsert,
    Remove,
}

/// One pending timer per path; re-armed on every raw event.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    queue: DelayQueue<PathBuf>,
    pending: HashMap<PathBuf, (Key, PendingAction)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    /// Record a raw event. The last action before the timer fires wins.
    pub fn record(&mut self, path: PathBuf, action: PendingAction) {
        match self.pending.get_mut(&path) {
            Some((key, pending_action)) => {
                *pending_action = action;
                self.queue.reset(key, self.window);
            }
            None => {
                let key = self.queue.insert(path.clone(), self.window);
                self.pending.insert(path, (key, action));
            }
        }
    }

    /// Await the next quiesced path. Pends while timers are outstanding;
    /// resolves `None` immediately when nothing is pending, so callers
    /// guard with [`Debouncer::is_empty`] inside `select!`.
    pub async fn next(&mut self) -> Option<(PathBuf, PendingAction)> {
        let expired = futures::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let path = expired.into_inner();
        // Drop the map entry before dispatching so a racing raw event for
        // the same path arms a fresh timer instead of touching a dead key.
        let (_, action) = self.pending.remove(&path)?;
        Some((path, action))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
