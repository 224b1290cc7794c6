//! Pool of server-generated UUIDs used as document id suffixes.
//!
//! UUIDs are fetched in batches so creates do not pay a round trip each. A
//! batch shorter than requested signals a transient backend failure and is
//! requested again under the retry policy.

use crate::config::RetryPolicy;
use crate::database::Database;
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

pub struct UuidPool {
    db: Arc<dyn Database>,
    batch_size: usize,
    retry: RetryPolicy,
    events: Arc<EventBus>,
    buffer: Mutex<Vec<String>>,
}

impl UuidPool {
    pub fn new(
        db: Arc<dyn Database>,
        batch_size: usize,
        retry: RetryPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            batch_size,
            retry,
            events,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Take one unused UUID, refilling the pool if it is empty.
    ///
    /// Concurrent callers queue on the pool lock, so at most one refill is in
    /// flight and no UUID is handed out twice.
    pub async fn next(&self) -> Result<String> {
        let mut buffer = self.buffer.lock().await;
        if let Some(uuid) = buffer.pop() {
            return Ok(uuid);
        }

        *buffer = self.fetch_batch().await?;
        buffer.pop().ok_or_else(|| {
            SyncError::Programming("UUID batch size must be positive".into())
        })
    }

    /// Number of UUIDs cached.
    pub async fn remaining(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn fetch_batch(&self) -> Result<Vec<String>> {
        let mut retry = 0;
        loop {
            let failure = match self.db.uuids(self.batch_size).await {
                Ok(batch) if batch.len() == self.batch_size => {
                    debug!("Fetched {} UUIDs", batch.len());
                    return Ok(batch);
                }
                Ok(batch) => {
                    warn!(
                        "UUID request returned {} of {}; retrying",
                        batch.len(),
                        self.batch_size
                    );
                    SyncError::NotAcknowledged(format!(
                        "uuids returned {} of {}",
                        batch.len(),
                        self.batch_size
                    ))
                }
                Err(e) => {
                    error!("UUID request failed: {}", e);
                    SyncError::from_db("uuids", "", e)
                }
            };

            retry += 1;
            if !self.retry.allows(retry) {
                error!("Giving up on UUID request after {} retries", retry - 1);
                return Err(SyncError::RetriesExhausted {
                    operation: "uuids",
                    id: String::new(),
                    attempts: retry - 1,
                    last: Box::new(failure),
                });
            }
            self.events.write_retried("", "uuids", "shortUuidBatch", retry);
            self.retry.wait(retry).await;
        }
    }
}
