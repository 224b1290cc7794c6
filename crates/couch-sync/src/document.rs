//! Documents as stored in the backing database.
//!
//! Synchronized documents are identified as `<collection>/<suffix>` and carry a
//! CouchDB-style `<generation>-<hash>` revision. Identifiers starting with `_`
//! are reserved for the database itself (design documents, local docs).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Prefix reserved for database-internal documents.
pub const SYSTEM_PREFIX: char = '_';

/// Separator between collection name and unique suffix.
pub const ID_SEPARATOR: char = '/';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocIdError {
    #[error("Document id has no collection prefix: {0}")]
    MissingCollection(String),

    #[error("Document id has no unique suffix: {0}")]
    MissingSuffix(String),

    #[error("Document id uses reserved prefix: {0}")]
    Reserved(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error("Invalid revision format: {0}")]
    InvalidFormat(String),

    #[error("Invalid revision generation: {0}")]
    InvalidGeneration(#[from] std::num::ParseIntError),
}

/// Returns true if `id` should be delivered by the change feed.
///
/// Only `<collection>/<suffix>` ids qualify, and nothing under the reserved
/// system prefix.
pub fn is_syncable_id(id: &str) -> bool {
    matches!(id.find(ID_SEPARATOR), Some(pos) if pos > 0) && !id.starts_with(SYSTEM_PREFIX)
}

/// Collection name owning `id`, if it has one.
pub fn collection_name(id: &str) -> Option<&str> {
    match id.split_once(ID_SEPARATOR) {
        Some((collection, _)) if !collection.is_empty() => Some(collection),
        _ => None,
    }
}

/// Identifier of a synchronized document: `<collection>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId {
    raw: String,
    split: usize,
}

impl DocId {
    /// Build an id from a collection name and a unique suffix.
    pub fn new(collection: &str, suffix: &str) -> Result<Self, DocIdError> {
        if collection.is_empty() {
            return Err(DocIdError::MissingCollection(format!("{collection}/{suffix}")));
        }
        if collection.starts_with(SYSTEM_PREFIX) {
            return Err(DocIdError::Reserved(collection.to_string()));
        }
        if collection.contains(ID_SEPARATOR) {
            return Err(DocIdError::InvalidCollection(collection.to_string()));
        }
        if suffix.is_empty() {
            return Err(DocIdError::MissingSuffix(format!("{collection}/")));
        }
        Ok(Self {
            raw: format!("{collection}{ID_SEPARATOR}{suffix}"),
            split: collection.len(),
        })
    }

    /// Parse a raw id, splitting at the first separator.
    pub fn parse(raw: &str) -> Result<Self, DocIdError> {
        if raw.starts_with(SYSTEM_PREFIX) {
            return Err(DocIdError::Reserved(raw.to_string()));
        }
        match raw.split_once(ID_SEPARATOR) {
            Some((collection, suffix)) => Self::new(collection, suffix),
            None => Err(DocIdError::MissingCollection(raw.to_string())),
        }
    }

    pub fn collection(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn suffix(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for DocId {
    type Err = DocIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocId {
    type Error = DocIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> Self {
        id.raw
    }
}

/// Revision marker: a strictly increasing generation plus an opaque hash.
///
/// Displays as `<generation>-<hash>`, the CouchDB `_rev` format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    /// Revision produced by the first write of a document.
    pub fn first() -> Self {
        Self::new(1, fresh_hash())
    }

    /// Revision produced by the next write on top of this one.
    pub fn next(&self) -> Self {
        Self::new(self.generation + 1, fresh_hash())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_first(&self) -> bool {
        self.generation == 1
    }
}

fn fresh_hash() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionError::InvalidFormat(s.to_string()))?;
        if hash.is_empty() {
            return Err(RevisionError::InvalidFormat(s.to_string()));
        }
        let generation: u64 = generation.parse()?;
        if generation == 0 {
            return Err(RevisionError::InvalidFormat(s.to_string()));
        }
        Ok(Self::new(generation, hash))
    }
}

impl TryFrom<String> for Revision {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// A stored document: id, revision, and arbitrary JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, rev: Option<Revision>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev,
            body,
        }
    }

    /// Whether the document carries the soft-delete flag.
    ///
    /// Any truthy value counts, matching the installed view's `!doc[field]`.
    pub fn is_soft_deleted(&self, field: &str) -> bool {
        self.body.get(field).is_some_and(is_truthy)
    }

    /// Parsed id, for documents that belong to a collection.
    pub fn doc_id(&self) -> Result<DocId, DocIdError> {
        DocId::parse(&self.id)
    }
}
/// JavaScript truthiness of a JSON value.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
