//! Cooperative pause and cancel signalling.
//!
//! One `ControlSignals` value is created per operation and handed to
//! whoever needs to steer it; there is no process-wide registry. Workers
//! poll between units of work, so both signals take effect at the next
//! unit boundary rather than mid-transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Shared pause/cancel flags for one running operation.
#[derive(Clone, Default)]
pub struct ControlSignals {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl ControlSignals {
    /// Create a fresh set of signals, unpaused and uncancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to hold at the next unit boundary.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Pause requested");
        }
    }

    /// Release a pause.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Resume requested");
            self.inner.notify.notify_waiters();
        }
    }

    /// Ask the operation to stop at the next unit boundary. Irreversible
    /// for this operation; also releases any workers parked in a pause.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancel requested");
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether a pause is in force.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Park until unpaused or cancelled. Returns `true` if the caller
    /// should keep working, `false` if the operation was cancelled.
    pub async fn wait_if_paused(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            // Re-check after registering interest; notify_waiters wakes us.
            let notified = self.inner.notify.notified();
            if !self.is_paused() || self.is_cancelled() {
                continue;
            }
            notified.await;
        }
    }

    /// Resolve once cancel is requested.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
