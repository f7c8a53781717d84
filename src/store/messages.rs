//! MessageStore: serialized read-modify-write access to message records.
//!
//! Every mutation goes through [`MessageStore::update`], which holds a
//! per-message lock for the duration of load → mutate → save and relies on
//! the row version to catch writers in other processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::types::{InboundMessage, MessageRecord, ProcessingStatus};
use crate::store::traits::Database;

/// How often a version conflict from another writer is retried in place.
const CONFLICT_RETRIES: usize = 3;

/// Stranded messages released per call.
const STALLED_BATCH: usize = 500;

pub struct MessageStore {
    db: Arc<dyn Database>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MessageStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Persist a freshly received message as `pending`.
    pub async fn insert(&self, message: InboundMessage) -> Result<MessageRecord, DatabaseError> {
        let record = MessageRecord::new(message);
        self.db.insert_message(&record).await?;
        info!(
            message_id = record.id(),
            tenant_id = record.tenant_id(),
            "Stored inbound message"
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        self.db.get_message(id).await
    }

    pub async fn require(&self, id: &str) -> Result<MessageRecord, DatabaseError> {
        self.db
            .get_message(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".to_string(),
                id: id.to_string(),
            })
    }

    pub async fn list_by_status(
        &self,
        status: ProcessingStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.db.list_messages_by_status(status, limit).await
    }

    /// Load, mutate, and save one record under its lock.
    ///
    /// If `mutate` fails nothing is saved. A version conflict with a writer
    /// outside this process reloads and reapplies `mutate`.
    pub async fn update<E, F>(&self, id: &str, mut mutate: F) -> Result<MessageRecord, E>
    where
        E: From<DatabaseError>,
        F: FnMut(&mut MessageRecord) -> Result<(), E>,
    {
        let lock = self.lock_for(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.update_locked(id, &mut mutate).await
        };
        self.release(id, lock).await;
        result
    }

    async fn update_locked<E, F>(&self, id: &str, mutate: &mut F) -> Result<MessageRecord, E>
    where
        E: From<DatabaseError>,
        F: FnMut(&mut MessageRecord) -> Result<(), E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.require(id).await?;
            mutate(&mut record)?;
            record.updated_at = Utc::now();

            match self.db.save_message(&record).await {
                Ok(version) => {
                    record.version = version;
                    return Ok(record);
                }
                Err(DatabaseError::Conflict { .. }) if attempt < CONFLICT_RETRIES => {
                    warn!(message_id = id, attempt, "Message changed underneath us, reapplying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Drop the map entry once nobody else holds or waits on it.
    async fn release(&self, id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().await;
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    // ── Operator-facing transitions ─────────────────────────────────

    /// A human answered the customer outside the pipeline; any pending
    /// automated send is suppressed.
    pub async fn mark_manually_answered(&self, id: &str) -> Result<MessageRecord, DatabaseError> {
        let record = self
            .update(id, |record: &mut MessageRecord| {
                record.manually_answered = true;
                Ok::<_, DatabaseError>(())
            })
            .await?;
        info!(message_id = id, "Message marked as manually answered");
        Ok(record)
    }

    /// Record that a completed message became a quote.
    pub async fn mark_converted_to_quote(
        &self,
        id: &str,
        quote_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        let record = self
            .update(id, |record: &mut MessageRecord| {
                record.transition(ProcessingStatus::ConvertedToQuote)?;
                record.quote_id = Some(quote_id.to_string());
                Ok::<_, PipelineError>(())
            })
            .await?;
        info!(message_id = id, quote_id, "Message converted to quote");
        Ok(record)
    }

    /// Put a failed message back to `pending` so intake picks it up again.
    pub async fn reset_for_retry(&self, id: &str) -> Result<MessageRecord, PipelineError> {
        let record = self
            .update(id, |record: &mut MessageRecord| {
                if record.processing_status != ProcessingStatus::Failed {
                    return Err(PipelineError::InvalidTransition {
                        from: record.processing_status.to_string(),
                        to: ProcessingStatus::Pending.to_string(),
                    });
                }
                record.transition(ProcessingStatus::Pending)?;
                record.processing_error = None;
                Ok(())
            })
            .await?;
        debug!(message_id = id, "Failed message reset to pending");
        Ok(record)
    }

    /// Move `processing` messages untouched for `stalled_after` back to
    /// `pending`. Their jobs died with a queue that keeps nothing across
    /// restarts. Returns how many were released.
    pub async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, PipelineError> {
        let Some(cutoff) = chrono::Duration::from_std(stalled_after)
            .ok()
            .and_then(|after| Utc::now().checked_sub_signed(after))
        else {
            return Ok(0);
        };

        let stalled: Vec<String> = self
            .list_by_status(ProcessingStatus::Processing, STALLED_BATCH)
            .await?
            .into_iter()
            .filter(|record| record.updated_at <= cutoff)
            .map(|record| record.id().to_string())
            .collect();

        let mut released = 0;
        for id in &stalled {
            let record = self
                .update(id, |record: &mut MessageRecord| {
                    // Picked up again since the listing.
                    if record.processing_status != ProcessingStatus::Processing
                        || record.updated_at > cutoff
                    {
                        return Ok(());
                    }
                    record.transition(ProcessingStatus::Pending)
                })
                .await?;
            if record.processing_status == ProcessingStatus::Pending {
                released += 1;
            }
        }
        if released > 0 {
            warn!(released, "Released messages stranded in processing");
        }
        Ok(released)
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}
