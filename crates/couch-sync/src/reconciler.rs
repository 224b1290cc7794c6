//! Change feed reconciler: applies remote document changes to local collections.
//!
//! The feed runs as a background task. Before each event it waits for the
//! `FeedGate` to open, so changes caused by an in-flight local write are only
//! processed once the write's outcome has been applied to the entity. Events
//! received while the gate is closed stay queued in arrival order.

use crate::database::{Change, ChangeStream, FeedEvent};
use crate::document::{collection_name, DocId};
use crate::events::{ChangeAction, EventBus, Subscription, SyncEvent};
use crate::gate::{FeedGate, Suspension};
use crate::model::Collections;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct Reconciler {
    collections: Collections,
    gate: FeedGate,
    events: Arc<EventBus>,
    soft_delete_field: String,
}

impl Reconciler {
    pub fn new(
        collections: Collections,
        gate: FeedGate,
        events: Arc<EventBus>,
        soft_delete_field: impl Into<String>,
    ) -> Self {
        Self {
            collections,
            gate,
            events,
            soft_delete_field: soft_delete_field.into(),
        }
    }

    /// Consume `stream` on a background task until it ends or the handle is dropped.
    pub fn start(self, mut stream: ChangeStream) -> FeedHandle {
        let gate = self.gate.clone();
        let events = Arc::clone(&self.events);

        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                self.gate.wait_open().await;
                match event {
                    FeedEvent::Change(change) => {
                        let action = self.apply(&change).await;
                        self.events.change_applied(&change.id, action);
                    }
                    FeedEvent::Error(e) => {
                        error!("Change feed error: {}", e);
                        self.events.feed_error(e.to_string());
                    }
                }
            }
            debug!("Change feed ended");
        });

        FeedHandle { task, gate, events }
    }

    /// Apply one change to the local collections.
    pub async fn apply(&self, change: &Change) -> ChangeAction {
        let Some(name) = collection_name(&change.id) else {
            debug!("Ignoring change to {}: no collection prefix", change.id);
            return ChangeAction::Ignored;
        };
        let Some(collection) = self.collections.get(name) else {
            debug!("Ignoring change to {}: collection {} is not registered", change.id, name);
            return ChangeAction::UnregisteredCollection;
        };
        let Ok(id) = DocId::parse(&change.id) else {
            debug!("Ignoring change to {}: not a collection document", change.id);
            return ChangeAction::Ignored;
        };

        // Let completion handlers scheduled by the resuming write run first.
        tokio::task::yield_now().await;

        let entity = collection.get(&id);
        let removed = change.deleted || change.doc.is_soft_deleted(&self.soft_delete_field);
        let first = change.doc.rev.as_ref().is_some_and(|rev| rev.is_first());

        match entity {
            Some(_) if removed => {
                collection.remove(&id);
                debug!("{} removed from {}", id, name);
                ChangeAction::Removed
            }
            None if first && !removed => match collection.insert_document(change.doc.clone()) {
                Some(_) => {
                    debug!("{} added to {}", id, name);
                    ChangeAction::Added
                }
                None => ChangeAction::Ignored,
            },
            Some(entity) if entity.rev() != change.doc.rev => {
                entity.replace_with(&change.doc);
                debug!("{} updated to {:?}", id, change.doc.rev);
                ChangeAction::Updated
            }
            _ => {
                debug!("{} already up to date", id);
                ChangeAction::Ignored
            }
        }
    }
}

/// Handle to a running change feed. Dropping it stops the feed.
pub struct FeedHandle {
    task: JoinHandle<()>,
    gate: FeedGate,
    events: Arc<EventBus>,
}

impl FeedHandle {
    /// Receive change and feed error events.
    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Pause delivery until the returned guard is released.
    pub fn suspend(&self) -> Suspension {
        self.gate.suspend()
    }

    pub fn is_paused(&self) -> bool {
        !self.gate.is_open()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DbError};
    use crate::document::{is_syncable_id, Document, Revision};
    use crate::memory::InMemoryDatabase;
    use crate::model::LocalCollection;
    use serde_json::{json, Map, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn change(id: &str, rev: &str, value: Value) -> Change {
        Change {
            seq: 1,
            id: id.to_string(),
            deleted: false,
            doc: Document::new(id, Some(rev.parse().unwrap()), body(value)),
        }
    }

    fn reconciler() -> (Reconciler, LocalCollection) {
        let collections = Collections::new();
        let widgets = LocalCollection::new("widgets");
        collections.register(widgets.clone());
        let reconciler = Reconciler::new(
            collections,
            FeedGate::new(),
            Arc::new(EventBus::new()),
            "isDeleted",
        );
        (reconciler, widgets)
    }

    #[tokio::test]
    async fn test_first_revision_is_added_once() {
        let (reconciler, widgets) = reconciler();
        let add = change("widgets/1", "1-a", json!({"name": "a"}));

        assert_eq!(reconciler.apply(&add).await, ChangeAction::Added);
        assert_eq!(reconciler.apply(&add).await, ChangeAction::Ignored);
        assert_eq!(widgets.len(), 1);
        assert_eq!(widgets.first().unwrap().get("name"), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_unknown_later_revision_is_ignored() {
        let (reconciler, widgets) = reconciler();
        let action = reconciler
            .apply(&change("widgets/1", "3-c", json!({"name": "c"})))
            .await;
        assert_eq!(action, ChangeAction::Ignored);
        assert!(widgets.is_empty());
    }

    #[tokio::test]
    async fn test_newer_revision_replaces_attributes() {
        let (reconciler, widgets) = reconciler();
        reconciler
            .apply(&change("widgets/1", "1-a", json!({"name": "a", "size": 1})))
            .await;

        let update = change("widgets/1", "2-b", json!({"name": "b"}));
        assert_eq!(reconciler.apply(&update).await, ChangeAction::Updated);
        assert_eq!(reconciler.apply(&update).await, ChangeAction::Ignored);

        let entity = widgets.first().unwrap();
        assert_eq!(entity.attributes(), body(json!({"name": "b"})));
        assert_eq!(entity.rev(), Some(Revision::new(2, "b")));
    }

    #[tokio::test]
    async fn test_soft_delete_removes_once() {
        let (reconciler, widgets) = reconciler();
        reconciler
            .apply(&change("widgets/1", "1-a", json!({"name": "a"})))
            .await;

        let delete = change("widgets/1", "2-b", json!({"name": "a", "isDeleted": true}));
        assert_eq!(reconciler.apply(&delete).await, ChangeAction::Removed);
        assert_eq!(reconciler.apply(&delete).await, ChangeAction::Ignored);
        assert!(widgets.is_empty());
    }

    #[tokio::test]
    async fn test_truthy_soft_delete_flag_removes() {
        let (reconciler, widgets) = reconciler();
        reconciler.apply(&change("widgets/1", "1-a", json!({}))).await;

        let delete = change("widgets/1", "2-b", json!({"isDeleted": 1}));
        assert_eq!(reconciler.apply(&delete).await, ChangeAction::Removed);
        assert!(widgets.is_empty());
    }

    #[tokio::test]
    async fn test_physical_delete_removes() {
        let (reconciler, widgets) = reconciler();
        reconciler.apply(&change("widgets/1", "1-a", json!({}))).await;

        let mut delete = change("widgets/1", "2-b", json!({}));
        delete.deleted = true;
        assert_eq!(reconciler.apply(&delete).await, ChangeAction::Removed);
        assert!(widgets.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_first_revision_is_not_added() {
        let (reconciler, widgets) = reconciler();
        let action = reconciler
            .apply(&change("widgets/1", "1-a", json!({"isDeleted": true})))
            .await;
        assert_eq!(action, ChangeAction::Ignored);
        assert!(widgets.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_collection() {
        let (reconciler, _widgets) = reconciler();
        let action = reconciler.apply(&change("gadgets/1", "1-a", json!({}))).await;
        assert_eq!(action, ChangeAction::UnregisteredCollection);
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for feed event")
            .expect("event channel closed")
    }

    type Started = (
        FeedHandle,
        LocalCollection,
        mpsc::UnboundedReceiver<SyncEvent>,
        Subscription,
    );

    fn started(db: &InMemoryDatabase) -> Started {
        let (reconciler, widgets) = reconciler();
        let handle = reconciler.start(db.changes(is_syncable_id));
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = handle.subscribe(move |event| {
            let _ = tx.send(event);
        });
        (handle, widgets, rx, subscription)
    }

    #[tokio::test]
    async fn test_feed_applies_remote_writes() {
        let db = InMemoryDatabase::existing();
        let (_handle, widgets, mut rx, _sub) = started(&db);

        db.save("widgets/1", None, &body(json!({"name": "a"})))
            .await
            .unwrap();

        match next_event(&mut rx).await {
            SyncEvent::ChangeApplied { id, action, .. } => {
                assert_eq!(id, "widgets/1");
                assert_eq!(action, ChangeAction::Added);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(widgets.len(), 1);
    }

    #[tokio::test]
    async fn test_suspended_feed_defers_delivery() {
        let db = InMemoryDatabase::existing();
        let (handle, widgets, mut rx, _sub) = started(&db);

        let hold = handle.suspend();
        assert!(handle.is_paused());
        db.save("widgets/1", None, &body(json!({"name": "a"})))
            .await
            .unwrap();
        db.save("widgets/2", None, &body(json!({"name": "b"})))
            .await
            .unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err());
        assert!(widgets.is_empty());

        hold.release();
        let mut order = Vec::new();
        for _ in 0..2 {
            if let SyncEvent::ChangeApplied { id, .. } = next_event(&mut rx).await {
                order.push(id);
            }
        }
        assert_eq!(order, vec!["widgets/1", "widgets/2"]);
        assert_eq!(widgets.len(), 2);
    }

    #[tokio::test]
    async fn test_feed_errors_are_published_and_feed_continues() {
        let db = InMemoryDatabase::existing();
        let (handle, widgets, mut rx, _sub) = started(&db);

        db.inject_feed_error(DbError::Unavailable("socket closed".into()));
        match next_event(&mut rx).await {
            SyncEvent::FeedError { message, .. } => assert!(message.contains("socket closed")),
            other => panic!("unexpected event {:?}", other),
        }

        db.save("widgets/1", None, &Map::new()).await.unwrap();
        next_event(&mut rx).await;
        assert_eq!(widgets.len(), 1);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_system_documents_are_filtered() {
        let db = InMemoryDatabase::existing();
        let (_handle, _widgets, mut rx, _sub) = started(&db);

        db.save("_design/other", None, &Map::new()).await.unwrap();
        db.save("widgets/1", None, &Map::new()).await.unwrap();

        match next_event(&mut rx).await {
            SyncEvent::ChangeApplied { id, .. } => assert_eq!(id, "widgets/1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_ends_feed() {
        let db = InMemoryDatabase::existing();
        let (handle, widgets, _rx, _sub) = started(&db);

        handle.stop();
        for _ in 0..10 {
            if !handle.is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_running());

        db.save("widgets/1", None, &Map::new()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(widgets.is_empty());
    }
}
