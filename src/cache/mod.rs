//! Event Cache
//!
//! Bounded FIFO of the most recent change events, keyed by event id. Serves
//! "everything since event X" replay for downstream readers; once X has been
//! evicted the reader must fall back to a full refresh.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use uuid::Uuid;

use crate::domain::ChangeEvent;

/// Errors from cache reads
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The prior event id has been evicted or was never cached
    #[error("Event id not cached: {0}")]
    NotCached(Uuid),
}

struct CacheState {
    /// Monotonic counter; ties insertion order to each cached event.
    next_sequence: u64,
    events: VecDeque<(u64, ChangeEvent)>,
    ids: HashMap<Uuid, u64>,
}

/// Bounded in-memory event cache. Single writer, many readers; the interior
/// is one value guarded by one lock, never patched concurrently.
pub struct EventCache {
    state: RwLock<CacheState>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                next_sequence: 0,
                events: VecDeque::with_capacity(capacity),
                ids: HashMap::new(),
            }),
            capacity,
        }
    }

    /// Append one event; evicts the oldest when at capacity. O(1).
    pub fn append(&self, event: ChangeEvent) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Self::append_locked(&mut state, self.capacity, event);
    }

    /// Append a flushed batch in order.
    pub fn append_batch(&self, events: &[ChangeEvent]) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for event in events {
            Self::append_locked(&mut state, self.capacity, event.clone());
        }
    }

    fn append_locked(state: &mut CacheState, capacity: usize, event: ChangeEvent) {
        if state.events.len() == capacity {
            if let Some((_, evicted)) = state.events.pop_front() {
                state.ids.remove(&evicted.event_id);
            }
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.ids.insert(event.event_id, sequence);
        state.events.push_back((sequence, event));
    }

    /// The ordered suffix of cached events strictly after `prior_id`.
    ///
    /// Fails with `NotCached` when `prior_id` has been evicted (or never
    /// appended); the caller cannot know whether events were missed.
    pub fn events_since(&self, prior_id: Uuid) -> Result<Vec<ChangeEvent>, CacheError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let prior_sequence = *state
            .ids
            .get(&prior_id)
            .ok_or(CacheError::NotCached(prior_id))?;

        Ok(state
            .events
            .iter()
            .filter(|(sequence, _)| *sequence > prior_sequence)
            .map(|(_, event)| event.clone())
            .collect())
    }

    pub fn contains(&self, event_id: Uuid) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.ids.contains_key(&event_id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventAction, EventData};
    use chrono::Utc;

    fn user_event(name: &str) -> ChangeEvent {
        ChangeEvent {
            event_id: Uuid::new_v4(),
            action: EventAction::Add,
            occurred_time: Utc::now(),
            hash_code: 0,
            data: EventData::User {
                user: name.to_string(),
            },
        }
    }

    #[test]
    fn test_suffix_after_prior_id() {
        let cache = EventCache::new(8);
        let e1 = user_event("a");
        let e2 = user_event("b");
        let e3 = user_event("c");
        cache.append_batch(&[e1.clone(), e2.clone(), e3.clone()]);

        let since = cache.events_since(e2.event_id).unwrap();
        assert_eq!(since, vec![e3.clone()]);

        let since_first = cache.events_since(e1.event_id).unwrap();
        assert_eq!(since_first, vec![e2, e3]);
    }

    #[test]
    fn test_eviction_is_fifo_and_bounded() {
        let cache = EventCache::new(2);
        let e1 = user_event("a");
        let e2 = user_event("b");
        let e3 = user_event("c");
        cache.append(e1.clone());
        cache.append(e2.clone());
        cache.append(e3.clone());

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(e1.event_id));

        // Evicted prior id reports not-cached rather than a partial suffix.
        assert!(matches!(
            cache.events_since(e1.event_id),
            Err(CacheError::NotCached(_))
        ));

        let since = cache.events_since(e2.event_id).unwrap();
        assert_eq!(since, vec![e3]);
    }

    #[test]
    fn test_suffix_of_newest_is_empty() {
        let cache = EventCache::new(4);
        let e1 = user_event("a");
        cache.append(e1.clone());
        assert!(cache.events_since(e1.event_id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_id_not_cached() {
        let cache = EventCache::new(4);
        cache.append(user_event("a"));
        assert!(cache.events_since(Uuid::new_v4()).is_err());
    }
}
