//! Metrics and the trip-switch
//!
//! Operation counters and duration accumulators, a long-lived worker that
//! logs a snapshot on an interval, and the latch that fails writes fast after
//! a persistence failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Process-wide operation counters and timers.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    events_buffered: AtomicU64,
    events_persisted: AtomicU64,
    events_cached: AtomicU64,
    buffer_flushes: AtomicU64,
    flush_failures: AtomicU64,
    bulk_batches: AtomicU64,
    queries_served: AtomicU64,
    routed_events: AtomicU64,
    routed_queries: AtomicU64,
    flush_duration_micros: AtomicU64,
    bulk_duration_micros: AtomicU64,
}

/// Point-in-time copy of the registry, serializable for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub events_buffered: u64,
    pub events_persisted: u64,
    pub events_cached: u64,
    pub buffer_flushes: u64,
    pub flush_failures: u64,
    pub bulk_batches: u64,
    pub queries_served: u64,
    pub routed_events: u64,
    pub routed_queries: u64,
    pub flush_duration_micros: u64,
    pub bulk_duration_micros: u64,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_events_buffered(&self) {
        self.events_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_cached(&self, count: u64) {
        self.events_cached.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_flush_failures(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_queries_served(&self) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_routed_events(&self) {
        self.routed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_routed_queries(&self) {
        self.routed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, events: u64, duration: Duration) {
        self.buffer_flushes.fetch_add(1, Ordering::Relaxed);
        self.events_persisted.fetch_add(events, Ordering::Relaxed);
        self.flush_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_bulk_batch(&self, events: u64, duration: Duration) {
        self.bulk_batches.fetch_add(1, Ordering::Relaxed);
        self.events_persisted.fetch_add(events, Ordering::Relaxed);
        self.bulk_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            events_cached: self.events_cached.load(Ordering::Relaxed),
            buffer_flushes: self.buffer_flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            bulk_batches: self.bulk_batches.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
            routed_events: self.routed_events.load(Ordering::Relaxed),
            routed_queries: self.routed_queries.load(Ordering::Relaxed),
            flush_duration_micros: self.flush_duration_micros.load(Ordering::Relaxed),
            bulk_duration_micros: self.bulk_duration_micros.load(Ordering::Relaxed),
        }
    }
}

/// Latched failure indicator. Once actuated, every new write operation fails
/// fast with an unavailable error until an operator resets it. Reads are
/// unaffected.
#[derive(Debug, Default)]
pub struct TripSwitch {
    tripped: AtomicBool,
}

impl TripSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actuate(&self) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            tracing::error!("Trip-switch actuated; write operations now fail fast");
        }
    }

    pub fn reset(&self) {
        if self.tripped.swap(false, Ordering::SeqCst) {
            tracing::info!("Trip-switch reset; write operations resumed");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

/// Long-lived worker that logs the metric snapshot on an interval.
pub struct MetricLogWorker {
    registry: Arc<MetricRegistry>,
    interval: Duration,
}

impl MetricLogWorker {
    pub fn new(registry: Arc<MetricRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Metric log worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let snapshot = self.registry.snapshot();
            tracing::info!(
                events_buffered = snapshot.events_buffered,
                events_persisted = snapshot.events_persisted,
                events_cached = snapshot.events_cached,
                buffer_flushes = snapshot.buffer_flushes,
                flush_failures = snapshot.flush_failures,
                bulk_batches = snapshot.bulk_batches,
                queries_served = snapshot.queries_served,
                routed_events = snapshot.routed_events,
                routed_queries = snapshot.routed_queries,
                "Metric snapshot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricRegistry::new();
        registry.incr_events_buffered();
        registry.incr_events_buffered();
        registry.record_flush(2, Duration::from_millis(5));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.events_buffered, 2);
        assert_eq!(snapshot.events_persisted, 2);
        assert_eq!(snapshot.buffer_flushes, 1);
        assert!(snapshot.flush_duration_micros >= 5_000);
    }

    #[test]
    fn test_trip_switch_latches_until_reset() {
        let switch = TripSwitch::new();
        assert!(!switch.is_tripped());

        switch.actuate();
        switch.actuate();
        assert!(switch.is_tripped());

        switch.reset();
        assert!(!switch.is_tripped());
    }
}
