//! Errors surfaced by sync operations.

use crate::database::DbError;
use crate::document::DocIdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Read of a single document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Write against a stale revision. Recovered internally by the update path.
    #[error("Document update conflict: {0}")]
    Conflict(String),

    /// Backend answered without acknowledging the write. Recovered by resubmitting.
    #[error("Write not acknowledged: {0}")]
    NotAcknowledged(String),

    /// Any other driver-reported failure.
    #[error("{operation} failed for {id}: {source}")]
    Backend {
        operation: &'static str,
        id: String,
        #[source]
        source: DbError,
    },

    /// Invalid use of the API.
    #[error("Programming error: {0}")]
    Programming(String),

    /// A recoverable condition persisted past the retry policy.
    #[error("{operation} gave up on {id} after {attempts} retries: {last}")]
    RetriesExhausted {
        operation: &'static str,
        id: String,
        attempts: u32,
        last: Box<SyncError>,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Classify a driver error raised by `operation` on `id`.
    pub(crate) fn from_db(operation: &'static str, id: &str, err: DbError) -> Self {
        match err {
            DbError::NotFound(_) => SyncError::NotFound(id.to_string()),
            DbError::Conflict(_) => SyncError::Conflict(id.to_string()),
            source => SyncError::Backend {
                operation,
                id: id.to_string(),
                source,
            },
        }
    }

    /// Whether the dispatcher retries this condition itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict(_) | SyncError::NotAcknowledged(_))
    }
}

impl From<DocIdError> for SyncError {
    fn from(err: DocIdError) -> Self {
        SyncError::Programming(err.to_string())
    }
}

pub(crate) fn missing_id(operation: &str) -> SyncError {
    SyncError::Programming(format!("{operation} requires an entity with an id"))
}
