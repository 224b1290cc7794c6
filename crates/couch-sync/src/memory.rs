//! In-memory database with CouchDB write semantics.
//!
//! Used for testing and for embedding without a server. Besides the
//! `Database` contract it exposes hooks to inject backend misbehavior
//! (unacknowledged saves, conflicts, short UUID batches, feed errors) and
//! to inspect what was written.

use crate::database::{
    Change, ChangeFilter, ChangeStream, Database, DbError, FeedEvent, Result, SaveResponse,
    ViewRow,
};
use crate::document::{Document, Revision, SYSTEM_PREFIX};
use crate::provision;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Misbehavior to apply to the next save.
#[derive(Debug, Clone)]
pub enum SaveFault {
    /// Answer `ok: false` without storing anything
    NotAcknowledged,
    /// Reject with a conflict without storing anything
    Conflict,
    /// Fail with the given error
    Error(DbError),
}

/// A save request as received by the database.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRecord {
    pub id: String,
    pub rev: Option<Revision>,
    pub body: Map<String, Value>,
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub gets: usize,
    pub saves: usize,
    pub conflicts: usize,
    pub unacknowledged: usize,
    pub views: usize,
    pub uuid_requests: usize,
}

struct StoredDoc {
    rev: Revision,
    body: Map<String, Value>,
    deleted: bool,
}

struct Subscriber {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct State {
    created: bool,
    seq: u64,
    docs: BTreeMap<String, StoredDoc>,
    subscribers: Vec<Subscriber>,
    save_faults: VecDeque<SaveFault>,
    uuid_shortfalls: VecDeque<usize>,
    save_log: Vec<SaveRecord>,
    stats: DbStats,
}

impl State {
    fn require_created(&self) -> Result<()> {
        if self.created {
            Ok(())
        } else {
            Err(DbError::NotFound("database does not exist".into()))
        }
    }

    fn publish(&mut self, change: Change) {
        // Drop subscribers whose stream has gone away.
        self.subscribers.retain(|sub| {
            if !(sub.filter)(&change.id) {
                return !sub.tx.is_closed();
            }
            sub.tx
                .unbounded_send(FeedEvent::Change(change.clone()))
                .is_ok()
        });
    }

    fn write(&mut self, id: &str, rev: Option<&Revision>, body: &Map<String, Value>) -> Result<Revision> {
        let current = self.docs.get(id).filter(|doc| !doc.deleted);
        let next = match (current, rev) {
            (None, None) => match self.docs.get(id) {
                // Recreating a physically deleted document continues its history.
                Some(tombstone) => tombstone.rev.next(),
                None => Revision::first(),
            },
            (Some(doc), Some(rev)) if doc.rev == *rev => doc.rev.next(),
            _ => return Err(DbError::Conflict(id.to_string())),
        };

        self.seq += 1;
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                rev: next.clone(),
                body: body.clone(),
                deleted: false,
            },
        );
        let doc = Document::new(id, Some(next.clone()), body.clone());
        let seq = self.seq;
        self.publish(Change {
            seq,
            id: id.to_string(),
            deleted: false,
            doc,
        });
        Ok(next)
    }
}

/// In-memory document database. Clones share the same store.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabase {
    /// A database whose backing store does not exist yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A database whose backing store already exists (without design docs).
    pub fn existing() -> Self {
        let db = Self::new();
        db.lock().created = true;
        db
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a fault for an upcoming save. Faults apply in FIFO order.
    pub fn inject_save_fault(&self, fault: SaveFault) {
        self.lock().save_faults.push_back(fault);
    }

    /// Make the next UUID request return only `len` ids.
    pub fn inject_short_uuid_batch(&self, len: usize) {
        self.lock().uuid_shortfalls.push_back(len);
    }

    /// Deliver an error event to every change subscriber.
    pub fn inject_feed_error(&self, error: DbError) {
        self.lock()
            .subscribers
            .retain(|sub| sub.tx.unbounded_send(FeedEvent::Error(error.clone())).is_ok());
    }

    /// Physically remove a document, as another client might.
    pub fn remove(&self, id: &str, rev: &Revision) -> Result<Revision> {
        let mut state = self.lock();
        state.require_created()?;
        let next = match state.docs.get(id) {
            Some(doc) if !doc.deleted && doc.rev == *rev => doc.rev.next(),
            Some(doc) if !doc.deleted => return Err(DbError::Conflict(id.to_string())),
            _ => return Err(DbError::NotFound(id.to_string())),
        };

        state.seq += 1;
        state.docs.insert(
            id.to_string(),
            StoredDoc {
                rev: next.clone(),
                body: Map::new(),
                deleted: true,
            },
        );
        let seq = state.seq;
        state.publish(Change {
            seq,
            id: id.to_string(),
            deleted: true,
            doc: Document::new(id, Some(next.clone()), Map::new()),
        });
        Ok(next)
    }

    /// Every save request received, in order, including rejected ones.
    pub fn save_log(&self) -> Vec<SaveRecord> {
        self.lock().save_log.clone()
    }

    pub fn stats(&self) -> DbStats {
        self.lock().stats
    }

    /// Number of live (not physically deleted) documents, design docs included.
    pub fn doc_count(&self) -> usize {
        self.lock().docs.values().filter(|doc| !doc.deleted).count()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn exists(&self) -> Result<bool> {
        tokio::task::yield_now().await;
        Ok(self.lock().created)
    }

    async fn create(&self) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.created {
            return Err(DbError::Request {
                error: "file_exists".into(),
                reason: "The database could not be created, the file already exists.".into(),
            });
        }
        state.created = true;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.require_created()?;
        state.stats.gets += 1;
        match state.docs.get(id) {
            Some(doc) if !doc.deleted => {
                Ok(Document::new(id, Some(doc.rev.clone()), doc.body.clone()))
            }
            _ => Err(DbError::NotFound(id.to_string())),
        }
    }

    async fn save(
        &self,
        id: &str,
        rev: Option<&Revision>,
        body: &Map<String, Value>,
    ) -> Result<SaveResponse> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.require_created()?;
        state.stats.saves += 1;
        state.save_log.push(SaveRecord {
            id: id.to_string(),
            rev: rev.cloned(),
            body: body.clone(),
        });

        match state.save_faults.pop_front() {
            Some(SaveFault::NotAcknowledged) => {
                state.stats.unacknowledged += 1;
                return Ok(SaveResponse {
                    ok: false,
                    id: id.to_string(),
                    rev: None,
                });
            }
            Some(SaveFault::Conflict) => {
                state.stats.conflicts += 1;
                return Err(DbError::Conflict(id.to_string()));
            }
            Some(SaveFault::Error(err)) => return Err(err),
            None => {}
        }

        match state.write(id, rev, body) {
            Ok(rev) => Ok(SaveResponse {
                ok: true,
                id: id.to_string(),
                rev: Some(rev),
            }),
            Err(err) => {
                if matches!(err, DbError::Conflict(_)) {
                    state.stats.conflicts += 1;
                }
                Err(err)
            }
        }
    }

    async fn view(&self, design: &str, view: &str, key: &str) -> Result<Vec<ViewRow>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.require_created()?;
        state.stats.views += 1;

        let installed = state
            .docs
            .get(design)
            .filter(|doc| !doc.deleted)
            .is_some_and(|doc| provision::defines_view(&doc.body, view));
        if !installed {
            return Err(DbError::NotFound(format!("{design}/_view/{view}")));
        }
        let soft_delete_field = state
            .docs
            .get(design)
            .and_then(|doc| provision::soft_delete_field(&doc.body, view))
            .unwrap_or_default();

        let rows = state
            .docs
            .iter()
            .filter(|(id, doc)| !doc.deleted && !id.starts_with(SYSTEM_PREFIX))
            .filter_map(|(id, doc)| {
                let doc = Document::new(id.as_str(), Some(doc.rev.clone()), doc.body.clone());
                provision::collection_row(&doc, &soft_delete_field)
            })
            .filter(|row| row.key == key)
            .collect();
        Ok(rows)
    }

    async fn uuids(&self, count: usize) -> Result<Vec<String>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.stats.uuid_requests += 1;
        let count = state
            .uuid_shortfalls
            .pop_front()
            .map_or(count, |len| len.min(count));
        Ok((0..count)
            .map(|_| uuid::Uuid::new_v4().simple().to_string())
            .collect())
    }

    fn changes(&self, filter: ChangeFilter) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded();
        self.lock().subscribers.push(Subscriber { filter, tx });
        rx.boxed()
    }
}
