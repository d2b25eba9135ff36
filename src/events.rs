//! Replayable progress event stream.
//!
//! Observers are pull-based: a late subscriber calls `replay()` to catch up
//! on the retained history, then follows the live broadcast channel. Nothing
//! in the engine blocks on observers; a slow subscriber lags its own
//! receiver, never the operation.

use crate::store::now_ms;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Events retained for replay by default.
pub const DEFAULT_RETENTION: usize = 1_024;

/// Severity of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Routine progress.
    Info,
    /// Degraded but continuing (failed file, lost checkpoint write).
    Warn,
    /// The operation stopped.
    Error,
}

/// One progress event. `seq` is strictly increasing per log, so a consumer
/// can join replayed history with the live stream without duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Position in the stream.
    pub seq: u64,
    /// Emission time (Unix ms).
    pub at_ms: i64,
    /// Severity.
    pub level: EventLevel,
    /// Human-readable description.
    pub message: String,
}

/// Bounded event history plus live broadcast.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    seq: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    retention: usize,
    live: broadcast::Sender<Event>,
}

impl EventLog {
    /// Create a log retaining the default number of events.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a log retaining up to `retention` events for replay.
    pub fn with_retention(retention: usize) -> Self {
        let (live, _) = broadcast::channel(retention.max(1));
        Self {
            inner: Arc::new(LogInner {
                seq: AtomicU64::new(0),
                history: Mutex::new(VecDeque::with_capacity(retention)),
                retention,
                live,
            }),
        }
    }

    /// Append an event and fan it out to live subscribers.
    pub fn emit(&self, level: EventLevel, message: impl Into<String>) -> Event {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            at_ms: now_ms(),
            level,
            message: message.into(),
        };
        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if history.len() == self.inner.retention {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is fine; replay still sees the event.
        let _ = self.inner.live.send(event.clone());
        event
    }

    /// `emit` at Info level.
    pub fn info(&self, message: impl Into<String>) -> Event {
        self.emit(EventLevel::Info, message)
    }

    /// `emit` at Warn level.
    pub fn warn(&self, message: impl Into<String>) -> Event {
        self.emit(EventLevel::Warn, message)
    }

    /// `emit` at Error level.
    pub fn error(&self, message: impl Into<String>) -> Event {
        self.emit(EventLevel::Error, message)
    }

    /// Snapshot of the retained history in emission order.
    pub fn replay(&self) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.live.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
