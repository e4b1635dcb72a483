//! Event infrastructure for repo-sync-core.
//!
//! Provides `SyncEvent` for status indicators/monitoring and `EventBus` for
//! subscriptions. Wrap the bus in `Arc` to subscribe.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use web_time::{SystemTime, UNIX_EPOCH};

/// Sync events emitted by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A pull finished and the snapshot moved to `reference`.
    PullApplied {
        reference: String,
        written: usize,
        deleted: usize,
        failed: usize,
        /// Milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// A pulled file could not be written or removed locally.
    FileWriteFailed {
        path: String,
        error: String,
        timestamp: f64,
    },
    /// A push produced a commit and moved the branch.
    CommitCreated {
        commit: String,
        paths: Vec<String>,
        timestamp: f64,
    },
    /// A push had nothing to commit.
    CommitSkipped {
        /// Number of intents that were suppressed.
        intents: usize,
        timestamp: f64,
    },
    /// A push found the branch moved by someone else and built on top of it.
    RemoteDiverged {
        expected: String,
        actual: String,
        timestamp: f64,
    },
    /// A pull or push failed.
    SyncFailed {
        operation: String,
        error: String,
        timestamp: f64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
