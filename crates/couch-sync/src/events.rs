//! Event infrastructure for observing sync activity.
//!
//! `EventBus` publishes `SyncEvent`s to subscribers; the change feed handle and
//! the dispatcher share one bus per plugin instance.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// What the reconciler did with an inbound change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeAction {
    /// Entity removed from its collection (deleted or soft-deleted upstream)
    Removed,
    /// New entity inserted from a first-revision document
    Added,
    /// Entity attributes replaced with a newer revision
    Updated,
    /// Local state already consistent (or not yet populated)
    Ignored,
    /// No local collection registered for the document's prefix
    UnregisteredCollection,
}

/// Sync events emitted for real-time monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Inbound change processed by the reconciler.
    ChangeApplied {
        /// Id of the changed document.
        id: String,
        /// Decision taken for the change.
        action: ChangeAction,
        /// When the change was applied, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Change feed reported an error.
    FeedError {
        /// Error description from the feed.
        message: String,
        /// When the error was received, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Local write confirmed by the database.
    WriteCompleted {
        /// Id of the written document.
        id: String,
        /// Operation: "create", "update" or "delete".
        operation: String,
        /// Revision produced by the write.
        rev: String,
        /// When the write completed, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Local write hit a recoverable condition and is being retried.
    WriteRetried {
        /// Id of the document (empty while a UUID batch is pending).
        id: String,
        /// Operation being retried.
        operation: String,
        /// "conflict", "notAcknowledged" or "shortUuidBatch".
        reason: String,
        /// Retry number, starting at 1.
        attempt: u32,
        /// When the retry was scheduled, in milliseconds since Unix epoch.
        timestamp: f64,
    },
}

/// Milliseconds since Unix epoch, for event timestamps.
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it to unsubscribe.
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
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
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
        // try_write: Drop may run while emit holds the read lock during unwinding.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking.
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

    pub(crate) fn change_applied(&self, id: &str, action: ChangeAction) {
        self.emit(SyncEvent::ChangeApplied {
            id: id.to_string(),
            action,
            timestamp: now_millis(),
        });
    }

    pub(crate) fn feed_error(&self, message: String) {
        self.emit(SyncEvent::FeedError {
            message,
            timestamp: now_millis(),
        });
    }

    pub(crate) fn write_completed(&self, id: &str, operation: &str, rev: &str) {
        self.emit(SyncEvent::WriteCompleted {
            id: id.to_string(),
            operation: operation.to_string(),
            rev: rev.to_string(),
            timestamp: now_millis(),
        });
    }

    pub(crate) fn write_retried(&self, id: &str, operation: &str, reason: &str, attempt: u32) {
        self.emit(SyncEvent::WriteRetried {
            id: id.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
            attempt,
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sample_event() -> SyncEvent {
        SyncEvent::ChangeApplied {
            id: "widgets/1".into(),
            action: ChangeAction::Updated,
            timestamp: 1000.0,
        }
    }

    fn recorder(bus: &Arc<EventBus>) -> (Arc<Mutex<Vec<SyncEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |event| sink.lock().unwrap().push(event));
        (seen, sub)
    }

    #[test]
    fn test_helpers_publish_sync_events() {
        let bus = Arc::new(EventBus::new());
        let (seen, _sub) = recorder(&bus);

        bus.change_applied("widgets/1", ChangeAction::Removed);
        bus.write_retried("widgets/1", "update", "conflict", 1);
        bus.write_completed("widgets/1", "update", "2-abc");
        bus.feed_error("socket closed".into());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(matches!(
            &seen[0],
            SyncEvent::ChangeApplied { id, action: ChangeAction::Removed, .. } if id == "widgets/1"
        ));
        assert!(matches!(
            &seen[1],
            SyncEvent::WriteRetried { reason, attempt: 1, .. } if reason == "conflict"
        ));
        assert!(matches!(
            &seen[2],
            SyncEvent::WriteCompleted { rev, .. } if rev == "2-abc"
        ));
        assert!(matches!(
            &seen[3],
            SyncEvent::FeedError { message, .. } if message == "socket closed"
        ));
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let (kept, _kept_sub) = recorder(&bus);
        let (dropped, dropped_sub) = recorder(&bus);
        assert_eq!(bus.subscriber_count(), 2);

        bus.change_applied("widgets/1", ChangeAction::Added);
        drop(dropped_sub);
        bus.write_retried("", "uuids", "shortUuidBatch", 1);

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(dropped.lock().unwrap().len(), 1);
        assert_eq!(kept.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let late = Arc::new(Mutex::new(Vec::new()));
        let inner_bus = Arc::clone(&bus);
        let inner_late = Arc::clone(&late);

        let _sub = bus.subscribe(move |_| {
            let sub = inner_bus.subscribe(|_| {});
            inner_late.lock().unwrap().push(sub);
        });

        bus.emit(sample_event());
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_sync_event_serialization() {
        let event = SyncEvent::WriteRetried {
            id: "widgets/1".into(),
            operation: "update".into(),
            reason: "conflict".into(),
            attempt: 2,
            timestamp: 1234567890.0,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"writeRetried\""));
        assert!(json.contains("\"operation\":\"update\""));
        assert!(json.contains("\"attempt\":2"));

        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("\"type\":\"changeApplied\""));
        assert!(json.contains("\"action\":\"updated\""));
    }
}
