//! Dispatcher: executes model persistence requests against the database.
//!
//! Requests are resolved once at the boundary from a verb and a target:
//!
//! - `read` on an entity fetches one document; on a collection it queries the
//!   collection view
//! - `create`/`update` on an entity becomes an update if the entity already
//!   carries a revision, otherwise a create
//! - `delete` sets the soft-delete flag and runs the update path
//!
//! Each write holds a feed `Suspension` from before the first save until the
//! outcome has been applied to the entity, so the reconciler never processes
//! a self-caused change before local state reflects it.
//!
//! Per write attempt: `Idle -> Pending -> {Succeeded | Conflict -> Pending | Error}`.
//! Unacknowledged saves are resubmitted unchanged; conflicts restart the
//! fetch-merge-save cycle. Both are bounded by the configured `RetryPolicy`.

use crate::config::SyncConfig;
use crate::database::{Database, DbError, SaveResponse};
use crate::document::{DocId, Document, Revision};
use crate::error::{missing_id, Result, SyncError};
use crate::events::EventBus;
use crate::gate::FeedGate;
use crate::model::{Entity, LocalCollection};
use crate::uuid_pool::UuidPool;
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Persistence verb requested by the model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Read,
    Create,
    Update,
    Delete,
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Read => "read",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        })
    }
}

impl FromStr for Verb {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Verb::Read),
            "create" => Ok(Verb::Create),
            "update" => Ok(Verb::Update),
            "delete" => Ok(Verb::Delete),
            other => Err(SyncError::Programming(format!("unknown sync verb: {other}"))),
        }
    }
}

/// What a verb is applied to.
#[derive(Debug, Clone)]
pub enum SyncTarget {
    Entity(Entity),
    /// Collection, by name
    Collection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

impl WriteKind {
    fn operation(self) -> &'static str {
        match self {
            WriteKind::Create => "create",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// A resolved persistence request.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    ReadEntity(DocId),
    ReadCollection(String),
    Write { entity: Entity, kind: WriteKind },
}

impl SyncRequest {
    /// Resolve a verb and target into a request.
    pub fn resolve(verb: Verb, target: SyncTarget) -> Result<Self> {
        match (verb, target) {
            (Verb::Read, SyncTarget::Entity(entity)) => entity
                .id()
                .map(SyncRequest::ReadEntity)
                .ok_or_else(|| missing_id("read")),
            (Verb::Read, SyncTarget::Collection(name)) => Ok(SyncRequest::ReadCollection(name)),
            (Verb::Create | Verb::Update, SyncTarget::Entity(entity)) => {
                // The revision, not the verb, decides: only stored entities have one.
                let kind = if entity.rev().is_some() {
                    WriteKind::Update
                } else {
                    WriteKind::Create
                };
                Ok(SyncRequest::Write { entity, kind })
            }
            (Verb::Delete, SyncTarget::Entity(entity)) => Ok(SyncRequest::Write {
                entity,
                kind: WriteKind::Delete,
            }),
            (verb, SyncTarget::Collection(name)) => Err(SyncError::Programming(format!(
                "cannot {verb} collection {name}"
            ))),
        }
    }
}

/// Result of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResponse {
    /// Single document read
    Document(Document),
    /// Collection read (possibly empty)
    Documents(Vec<Document>),
    /// New document stored
    Created { id: DocId, rev: Revision },
    /// Existing document updated (or soft-deleted)
    Updated { rev: Revision },
}

impl SyncResponse {
    /// Revision produced by a write, if this was one.
    pub fn rev(&self) -> Option<&Revision> {
        match self {
            SyncResponse::Created { rev, .. } | SyncResponse::Updated { rev } => Some(rev),
            _ => None,
        }
    }
}

/// Executes `SyncRequest`s. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<dyn Database>,
    config: Arc<SyncConfig>,
    uuids: Arc<UuidPool>,
    gate: FeedGate,
    events: Arc<EventBus>,
    provisioned: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        config: Arc<SyncConfig>,
        gate: FeedGate,
        events: Arc<EventBus>,
    ) -> Self {
        let uuids = Arc::new(UuidPool::new(
            Arc::clone(&db),
            config.uuid_batch_size,
            config.retry.clone(),
            Arc::clone(&events),
        ));
        Self {
            db,
            config,
            uuids,
            gate,
            events,
            provisioned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Allow requests once the store is known to exist.
    pub fn mark_provisioned(&self) {
        self.provisioned.store(true, Ordering::Release);
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    pub fn uuid_pool(&self) -> &UuidPool {
        &self.uuids
    }

    /// Execute a request.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        if !self.is_provisioned() {
            error!("Tried to interact with the database before it was provisioned");
            return Err(SyncError::Programming(
                "database is not provisioned; call init first".into(),
            ));
        }

        match request {
            SyncRequest::ReadEntity(id) => self.read_entity(&id).await,
            SyncRequest::ReadCollection(name) => self.read_collection(&name).await,
            SyncRequest::Write { entity, kind } => match kind {
                WriteKind::Create => self.create(&entity).await,
                WriteKind::Update => self.update(&entity, kind.operation()).await,
                WriteKind::Delete => self.delete(&entity).await,
            },
        }
    }

    /// Read a collection and replace its local contents with the result.
    pub async fn fetch_collection(&self, collection: &LocalCollection) -> Result<usize> {
        let request = SyncRequest::ReadCollection(collection.name().to_string());
        match self.sync(request).await? {
            SyncResponse::Documents(docs) => {
                let count = docs.len();
                collection.reset(docs);
                Ok(count)
            }
            other => Err(SyncError::Programming(format!(
                "collection read returned {other:?}"
            ))),
        }
    }

    async fn read_entity(&self, id: &DocId) -> Result<SyncResponse> {
        match self.db.get(id.as_str()).await {
            Ok(doc) => Ok(SyncResponse::Document(doc)),
            Err(e) => {
                let err = SyncError::from_db("read", id.as_str(), e);
                error!("read: {}", err);
                Err(err)
            }
        }
    }

    async fn read_collection(&self, name: &str) -> Result<SyncResponse> {
        let rows = self
            .db
            .view(&self.config.design_document, &self.config.collection_view, name)
            .await
            .map_err(|e| {
                error!("read: collection {}: {}", name, e);
                SyncError::Backend {
                    operation: "read",
                    id: name.to_string(),
                    source: e,
                }
            })?;

        let docs = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<Document>(row.value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("read: skipping malformed row {} in {}: {}", row.id, name, e);
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!("read: collection {} returned {} documents", name, docs.len());
        Ok(SyncResponse::Documents(docs))
    }

    async fn create(&self, entity: &Entity) -> Result<SyncResponse> {
        if let Some(id) = entity.id() {
            return Err(SyncError::Programming(format!(
                "create on {id}, which is already stored"
            )));
        }

        let suffix = self.uuids.next().await?;
        let id = DocId::new(&entity.collection(), &suffix)?;
        let body = entity.attributes();

        let suspension = self.gate.suspend();
        let rev = self
            .save_acknowledged("create", &id, None, &body)
            .await
            .inspect_err(|e| error!("create: {}: {}", id, e))?;

        if !entity.assign(id.clone(), rev.clone()) {
            warn!("create: entity was stored concurrently; {} is a duplicate", id);
        }
        info!("create: {} at {}", id, rev);
        self.events
            .write_completed(id.as_str(), "create", &rev.to_string());
        suspension.release();

        Ok(SyncResponse::Created { id, rev })
    }

    async fn update(&self, entity: &Entity, operation: &'static str) -> Result<SyncResponse> {
        let id = entity.id().ok_or_else(|| missing_id(operation))?;

        let suspension = self.gate.suspend();
        let mut retry = 0;
        let rev = loop {
            // Start from the stored document so partial updates keep server
            // fields, and write against its revision rather than the entity's.
            let current = self.db.get(id.as_str()).await.map_err(|e| {
                let err = SyncError::from_db(operation, id.as_str(), e);
                error!("{}: fetch failed: {}", operation, err);
                err
            })?;
            let base = current.rev.clone().ok_or_else(|| SyncError::Backend {
                operation,
                id: id.to_string(),
                source: DbError::Request {
                    error: "bad_response".into(),
                    reason: "stored document has no revision".into(),
                },
            })?;

            let mut body = current.body;
            body.extend(entity.attributes());

            match self.save_acknowledged(operation, &id, Some(&base), &body).await {
                Ok(rev) => break rev,
                Err(SyncError::Conflict(_)) => {
                    retry += 1;
                    warn!("{}: document update conflict on {}; retrying", operation, id);
                    self.before_retry(
                        operation,
                        &id,
                        "conflict",
                        retry,
                        SyncError::Conflict(id.to_string()),
                    )
                    .await?;
                }
                Err(e) => {
                    error!("{}: {}: {}", operation, id, e);
                    return Err(e);
                }
            }
        };

        entity.set_rev(rev.clone());
        info!("{}: {} at {}", operation, id, rev);
        self.events
            .write_completed(id.as_str(), operation, &rev.to_string());
        suspension.release();

        Ok(SyncResponse::Updated { rev })
    }

    async fn delete(&self, entity: &Entity) -> Result<SyncResponse> {
        // Documents are never removed, only flagged.
        entity.set(self.config.soft_delete_field.clone(), Value::Bool(true));
        self.update(entity, WriteKind::Delete.operation()).await
    }

    /// Save until the database acknowledges the write.
    ///
    /// Conflicts are returned to the caller; other errors are terminal.
    async fn save_acknowledged(
        &self,
        operation: &'static str,
        id: &DocId,
        rev: Option<&Revision>,
        body: &Map<String, Value>,
    ) -> Result<Revision> {
        let mut retry = 0;
        loop {
            match self.db.save(id.as_str(), rev, body).await {
                Ok(SaveResponse {
                    ok: true,
                    rev: Some(rev),
                    ..
                }) => return Ok(rev),
                Ok(_) => {
                    retry += 1;
                    warn!(
                        "{}: database did not acknowledge {}; saving again",
                        operation, id
                    );
                    self.before_retry(
                        operation,
                        id,
                        "notAcknowledged",
                        retry,
                        SyncError::NotAcknowledged(id.to_string()),
                    )
                    .await?;
                }
                Err(e) => return Err(SyncError::from_db(operation, id.as_str(), e)),
            }
        }
    }

    /// Check the retry budget, publish the retry and wait out the backoff.
    async fn before_retry(
        &self,
        operation: &'static str,
        id: &DocId,
        reason: &str,
        retry: u32,
        failure: SyncError,
    ) -> Result<()> {
        if !self.config.retry.allows(retry) {
            error!(
                "{}: giving up on {} after {} retries ({})",
                operation,
                id,
                retry - 1,
                reason
            );
            return Err(SyncError::RetriesExhausted {
                operation,
                id: id.to_string(),
                attempts: retry - 1,
                last: Box::new(failure),
            });
        }
        self.events.write_retried(id.as_str(), operation, reason, retry);
        self.config.retry.wait(retry).await;
        Ok(())
    }
}
