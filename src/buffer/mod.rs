//! Event Buffer & Flush Strategy
//!
//! Writers append change events here and return as soon as the event has an
//! identity; durability is established by the next successful flush. A single
//! long-lived worker drains the queue into the bulk processor when the size
//! limit is reached or the flush interval elapses, whichever comes first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::cache::EventCache;
use crate::domain::{ChangeEvent, EventAction, EventData};
use crate::event_store::StoreError;
use crate::metrics::{MetricRegistry, TripSwitch};
use crate::processor::BulkEventProcessor;
use crate::sharding::element_hash;

struct BufferState {
    queue: VecDeque<ChangeEvent>,
    last_instant: Option<DateTime<Utc>>,
}

impl BufferState {
    /// Issue the event's occurred time: wall clock, never retreating. If the
    /// clock appears to move backwards, carry forward the last issued instant
    /// plus one microsecond.
    fn next_instant(&mut self) -> DateTime<Utc> {
        let now = truncate_to_micros(Utc::now());
        let instant = match self.last_instant {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_instant = Some(instant);
        instant
    }
}

/// Postgres timestamps resolve to microseconds; issue instants at the same
/// granularity so the stored value equals the issued one.
fn truncate_to_micros(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(instant.timestamp_micros()).unwrap_or(instant)
}

/// In-memory queue of events awaiting persistence. Insertion order is flush
/// order.
pub struct EventBuffer {
    state: Mutex<BufferState>,
    flush_requested: Notify,
    flushed: Notify,
    size_limit: usize,
}

impl EventBuffer {
    pub fn new(size_limit: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                last_instant: None,
            }),
            flush_requested: Notify::new(),
            flushed: Notify::new(),
            size_limit,
        }
    }

    /// Append an event, assigning its id, occurred time and routing hash.
    /// Returns the assigned event id once the event is queued.
    ///
    /// A full buffer blocks the caller until a flush makes room.
    pub async fn append(&self, action: EventAction, data: EventData) -> Uuid {
        loop {
            let mut state = self.state.lock().await;
            if state.queue.len() >= self.size_limit {
                // Register for the flushed signal before releasing the lock so
                // a flush completing in between still wakes us.
                let flushed = self.flushed.notified();
                drop(state);
                self.flush_requested.notify_one();
                flushed.await;
                continue;
            }

            let occurred_time = state.next_instant();
            let hash_code = element_hash(data.hash_key());
            let event = ChangeEvent {
                event_id: Uuid::new_v4(),
                action,
                occurred_time,
                hash_code,
                data,
            };
            let event_id = event.event_id;
            state.queue.push_back(event);
            let full = state.queue.len() >= self.size_limit;
            drop(state);

            if full {
                self.flush_requested.notify_one();
            }
            return event_id;
        }
    }

    /// Drain the queue in insertion order.
    pub async fn drain(&self) -> Vec<ChangeEvent> {
        let mut state = self.state.lock().await;
        state.queue.drain(..).collect()
    }

    /// Put a failed batch back at the head of the queue, preserving order.
    pub async fn requeue_front(&self, events: Vec<ChangeEvent>) {
        let mut state = self.state.lock().await;
        for event in events.into_iter().rev() {
            state.queue.push_front(event);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Completes when a size-triggered flush has been requested.
    pub async fn flush_requested(&self) {
        self.flush_requested.notified().await;
    }

    /// Wake appenders blocked on a full queue.
    pub fn notify_flushed(&self) {
        self.flushed.notify_waiters();
    }
}

/// Long-lived flush worker: one per buffer, so flushes are single-flight and
/// size/interval triggers coalesce.
pub struct FlushWorker {
    buffer: Arc<EventBuffer>,
    processor: BulkEventProcessor,
    cache: Arc<EventCache>,
    trip_switch: Arc<TripSwitch>,
    metrics: Arc<MetricRegistry>,
    interval: Duration,
}

impl FlushWorker {
    pub fn new(
        buffer: Arc<EventBuffer>,
        processor: BulkEventProcessor,
        cache: Arc<EventCache>,
        trip_switch: Arc<TripSwitch>,
        metrics: Arc<MetricRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            processor,
            cache,
            trip_switch,
            metrics,
            interval,
        }
    }

    /// Start the flush loop in the background.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Flush worker started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.buffer.flush_requested() => {}
            }

            match self.flush_once().await {
                Ok(0) => {}
                Ok(flushed) => {
                    tracing::debug!(events = flushed, "Flushed event buffer");
                }
                Err(e @ StoreError::InvariantViolation { .. }) => {
                    tracing::error!(error = %e, "Invariant violation during flush; aborting");
                    std::process::abort();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Event buffer flush failed; trip-switch actuated");
                }
            }
        }
    }

    /// Flush the buffered events as one transactional batch. On success the
    /// batch is appended to the event cache; on failure the events return to
    /// the buffer and the trip-switch latches.
    pub async fn flush_once(&self) -> Result<usize, StoreError> {
        let batch = self.buffer.drain().await;
        if batch.is_empty() {
            self.buffer.notify_flushed();
            return Ok(0);
        }

        let started = std::time::Instant::now();
        match self.processor.process_events(&batch, false).await {
            Ok(applied) => {
                self.metrics.record_flush(applied as u64, started.elapsed());
                self.cache.append_batch(&batch);
                self.metrics.add_events_cached(batch.len() as u64);
                self.buffer.notify_flushed();
                Ok(applied)
            }
            Err(e) => {
                self.trip_switch.actuate();
                self.metrics.incr_flush_failures();
                self.buffer.requeue_front(batch).await;
                self.buffer.notify_flushed();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_identity_and_hash() {
        let buffer = EventBuffer::new(16);
        let id = buffer
            .append(
                EventAction::Add,
                EventData::User {
                    user: "alice".to_string(),
                },
            )
            .await;

        let events = buffer.drain().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, id);
        assert_eq!(events[0].hash_code, element_hash("alice"));
    }

    #[tokio::test]
    async fn test_append_order_is_insertion_order() {
        let buffer = EventBuffer::new(16);
        for name in ["a", "b", "c"] {
            buffer
                .append(
                    EventAction::Add,
                    EventData::User {
                        user: name.to_string(),
                    },
                )
                .await;
        }

        let events = buffer.drain().await;
        let names: Vec<&str> = events
            .iter()
            .map(|e| match &e.data {
                EventData::User { user } => user.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_occurred_times_never_retreat() {
        let buffer = EventBuffer::new(64);
        for i in 0..20 {
            buffer
                .append(
                    EventAction::Add,
                    EventData::User {
                        user: format!("user-{}", i),
                    },
                )
                .await;
        }

        let events = buffer.drain().await;
        for pair in events.windows(2) {
            assert!(pair[0].occurred_time <= pair[1].occurred_time);
        }
    }

    #[test]
    fn test_clock_regression_carries_forward() {
        let mut state = BufferState {
            queue: VecDeque::new(),
            last_instant: Some(truncate_to_micros(Utc::now()) + chrono::Duration::hours(1)),
        };

        let ahead = state.last_instant.unwrap();
        let issued = state.next_instant();
        assert_eq!(issued, ahead + chrono::Duration::microseconds(1));
    }

    #[tokio::test]
    async fn test_requeue_front_preserves_order() {
        let buffer = EventBuffer::new(16);
        for name in ["a", "b"] {
            buffer
                .append(
                    EventAction::Add,
                    EventData::User {
                        user: name.to_string(),
                    },
                )
                .await;
        }

        let drained = buffer.drain().await;
        buffer.requeue_front(drained.clone()).await;
        let again = buffer.drain().await;
        assert_eq!(drained, again);
    }
}
