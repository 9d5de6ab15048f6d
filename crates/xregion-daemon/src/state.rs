//! Shared scheduler state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Shared scheduler state.
pub type SharedState = Arc<SchedulerState>;

/// Shutdown flag and start time shared by the phase loops.
#[derive(Debug)]
pub struct SchedulerState {
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Wakes loops sleeping on their interval.
    shutdown_notify: Notify,
    /// Time when the scheduler started.
    started_at: DateTime<Utc>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    /// Create a new scheduler state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            started_at: Utc::now(),
        }
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every waiting loop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let notified = self.shutdown_notify.notified();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Get the scheduler start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get scheduler uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
