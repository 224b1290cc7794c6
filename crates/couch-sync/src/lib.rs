//! couch-sync: Model persistence over CouchDB-style document databases.
//!
//! This crate provides:
//! - A dispatcher translating create/read/update/delete requests into
//!   revision-checked writes, retrying conflicts and unacknowledged saves
//! - A change-feed reconciler keeping local collections in step with writes
//!   made by other clients
//! - A feed gate that holds back the feed while local writes are in flight
//! - The `Database` driver abstraction and an in-memory implementation

pub mod config;
pub mod context;
pub mod database;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod events;
pub mod gate;
pub mod memory;
pub mod model;
pub mod provision;
pub mod reconciler;
pub mod uuid_pool;

pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use context::CouchSync;
pub use database::{Change, ChangeStream, Database, DbError, FeedEvent, SaveResponse, ViewRow};
pub use dispatcher::{Dispatcher, SyncRequest, SyncResponse, SyncTarget, Verb, WriteKind};
pub use document::{DocId, DocIdError, Document, Revision, RevisionError};
pub use error::{Result, SyncError};
pub use events::{ChangeAction, EventBus, Subscription, SyncEvent};
pub use gate::{FeedGate, Suspension};
pub use memory::{InMemoryDatabase, SaveFault};
pub use model::{Collections, Entity, LocalCollection};
pub use provision::{ensure_store, Provisioned};
pub use reconciler::{FeedHandle, Reconciler};
pub use uuid_pool::UuidPool;
