//! `CouchSync`: one plugin instance binding a database to local collections.
//!
//! Owns everything the dispatcher and the reconciler share: the database
//! handle, configuration, UUID pool, feed gate, collection registry and event
//! bus. Instances are independent of each other.

use crate::config::{ConfigError, SyncConfig};
use crate::database::Database;
use crate::dispatcher::{Dispatcher, SyncRequest, SyncResponse, SyncTarget, Verb};
use crate::document::is_syncable_id;
use crate::error::Result;
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::gate::FeedGate;
use crate::model::{Collections, LocalCollection};
use crate::provision::ensure_store;
use crate::reconciler::{FeedHandle, Reconciler};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct CouchSync {
    db: Arc<dyn Database>,
    config: Arc<SyncConfig>,
    collections: Collections,
    gate: FeedGate,
    events: Arc<EventBus>,
    dispatcher: Dispatcher,
    feed: Mutex<Option<FeedHandle>>,
}

impl CouchSync {
    /// Bind `db` with `config`. Nothing is sent to the database until `init`.
    pub fn attach(db: Arc<dyn Database>, config: SyncConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let gate = FeedGate::new();
        let events = Arc::new(EventBus::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&db),
            Arc::clone(&config),
            gate.clone(),
            Arc::clone(&events),
        );

        Ok(Self {
            db,
            config,
            collections: Collections::new(),
            gate,
            events,
            dispatcher,
            feed: Mutex::new(None),
        })
    }

    /// Provision the store if needed and start the change feed.
    ///
    /// Calling it again while the feed is running does nothing.
    pub async fn init(&self) -> Result<()> {
        let mut feed = self.feed.lock().await;
        if feed.is_some() {
            debug!("{} already initialized", self.config.database);
            return Ok(());
        }

        let provisioned = ensure_store(self.db.as_ref(), &self.config).await?;
        self.dispatcher.mark_provisioned();

        let reconciler = Reconciler::new(
            self.collections.clone(),
            self.gate.clone(),
            Arc::clone(&self.events),
            self.config.soft_delete_field.clone(),
        );
        *feed = Some(reconciler.start(self.db.changes(is_syncable_id)));

        info!(
            "Sync initialized for {} ({:?}); change feed running",
            self.config.database, provisioned
        );
        Ok(())
    }

    /// Stop the change feed. Requests keep working; `init` restarts the feed.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.feed.lock().await.take() {
            handle.stop();
            info!("Change feed stopped for {}", self.config.database);
        }
    }

    pub async fn is_feed_running(&self) -> bool {
        self.feed
            .lock()
            .await
            .as_ref()
            .is_some_and(FeedHandle::is_running)
    }

    /// Resolve and execute a persistence request.
    pub async fn sync(&self, verb: Verb, target: SyncTarget) -> Result<SyncResponse> {
        let request = SyncRequest::resolve(verb, target)?;
        self.dispatcher.sync(request).await
    }

    /// Replace a collection's contents with what the database holds.
    pub async fn fetch(&self, collection: &LocalCollection) -> Result<usize> {
        self.dispatcher.fetch_collection(collection).await
    }

    /// The registered collection called `name`, registering an empty one if needed.
    pub fn collection(&self, name: &str) -> LocalCollection {
        if let Some(collection) = self.collections.get(name) {
            return collection;
        }
        let collection = LocalCollection::new(name);
        self.collections.register(collection.clone());
        collection
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn feed_gate(&self) -> &FeedGate {
        &self.gate
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
