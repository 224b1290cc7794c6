//! Database trait: the driver contract the dispatcher and reconciler rely on.
//!
//! Implementations:
//! - `InMemoryDatabase` - CouchDB semantics in memory, for testing and embedding
//! - HTTP drivers live outside this crate
//!
//! The contract mirrors a CouchDB client: documents are saved against a base
//! revision, collections are read through a map view, and mutations are
//! published on a change feed.

use crate::document::{Document, Revision};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Request failed ({error}): {reason}")]
    Request { error: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Response to a save request.
///
/// `ok == false` without an error means the backend did not acknowledge the
/// write; callers resubmit in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub ok: bool,
    pub id: String,
    pub rev: Option<Revision>,
}

/// A row emitted by a map view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: String,
    pub value: Value,
}

/// A single mutation delivered by the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Database update sequence
    pub seq: u64,
    /// Id of the changed document
    pub id: String,
    /// True if the document was physically removed
    pub deleted: bool,
    /// Document state after the change
    pub doc: Document,
}

/// Item delivered on the change feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Change(Change),
    Error(DbError),
}

/// Predicate selecting which document ids the feed delivers.
pub type ChangeFilter = fn(&str) -> bool;

/// Live change subscription. Items are delivered in database order.
pub type ChangeStream = BoxStream<'static, FeedEvent>;

/// Document database abstraction.
#[async_trait]
pub trait Database: Send + Sync {
    /// Check if the backing store exists
    async fn exists(&self) -> Result<bool>;

    /// Create the backing store
    async fn create(&self) -> Result<()>;

    /// Fetch the current revision of a document
    async fn get(&self, id: &str) -> Result<Document>;

    /// Write a document on top of `rev` (`None` for a new document)
    async fn save(
        &self,
        id: &str,
        rev: Option<&Revision>,
        body: &Map<String, Value>,
    ) -> Result<SaveResponse>;

    /// Query a map view for rows matching `key`
    async fn view(&self, design: &str, view: &str, key: &str) -> Result<Vec<ViewRow>>;

    /// Request `count` server-generated UUIDs
    async fn uuids(&self, count: usize) -> Result<Vec<String>>;

    /// Subscribe to changes from now on, filtered by id
    fn changes(&self, filter: ChangeFilter) -> ChangeStream;
}
