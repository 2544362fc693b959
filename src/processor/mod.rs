//! Bulk Event Processor
//!
//! Applies an ordered batch of change events to the temporal store in a
//! single transaction: the whole batch commits or none of it does.
//!
//! Unknown event kinds or actions never reach this module; the typed event
//! model rejects them during request deserialization, before any write.

use tokio::time::sleep;

use crate::domain::ChangeEvent;
use crate::event_store::{StoreError, TemporalEventStore};

/// Transactional dispatcher from event batches to store operations.
#[derive(Debug, Clone)]
pub struct BulkEventProcessor {
    store: TemporalEventStore,
}

impl BulkEventProcessor {
    pub fn new(store: TemporalEventStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TemporalEventStore {
        &self.store
    }

    /// Apply the batch in input order.
    ///
    /// Strict mode (`ignore_preexisting = false`) rejects any duplicate event
    /// id. With `ignore_preexisting = true`, events whose id is already in the
    /// store's index are skipped, which makes replay idempotent.
    ///
    /// Returns the number of events applied. Deadlock-class failures retry
    /// the whole batch in a fresh transaction, up to the store's budget.
    pub async fn process_events(
        &self,
        events: &[ChangeEvent],
        ignore_preexisting: bool,
    ) -> Result<usize, StoreError> {
        let max_attempts = self.store.retry_max_attempts();

        for attempt in 0..max_attempts {
            match self.try_process_events(events, ignore_preexisting).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_retryable() && attempt < max_attempts - 1 => {
                    let delay = self.store.retry_backoff() * (attempt + 1);
                    tracing::warn!(
                        batch_len = events.len(),
                        "Deadlock processing event batch, retrying (attempt {}/{})",
                        attempt + 1,
                        max_attempts
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::MaxRetriesExceeded)
    }

    /// Single attempt: one serializable transaction over the entire batch.
    async fn try_process_events(
        &self,
        events: &[ChangeEvent],
        ignore_preexisting: bool,
    ) -> Result<usize, StoreError> {
        let mut tx = self.store.begin_serializable().await?;
        let mut applied = 0;

        for event in events {
            if ignore_preexisting && self.store.event_exists(&mut tx, event.event_id).await? {
                tracing::debug!(event_id = %event.event_id, "Skipping preexisting event");
                continue;
            }

            self.store.apply_event_tx(&mut tx, event).await?;
            applied += 1;
        }

        tx.commit().await?;
        Ok(applied)
    }
}
