//! Bounded index of delivered event keys.
//!
//! Consulted before any backfill-tagged event reaches the consumer, and fed
//! by the live delivery path, so the same identity key is never delivered
//! twice across the two paths. Retention is bounded: once capacity is
//! reached, the oldest keys are evicted in insertion order.

use std::collections::{HashSet, VecDeque};

use crate::events::EventKey;

/// FIFO-evicting set of delivered event keys.
///
/// Not internally synchronized; the engine wraps it in a lock.
#[derive(Debug)]
pub struct DedupIndex {
    seen: HashSet<EventKey>,
    order: VecDeque<EventKey>,
    capacity: usize,
}

impl DedupIndex {
    /// Create an index retaining at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1 << 20)),
            order: VecDeque::with_capacity(capacity.min(1 << 20)),
            capacity: capacity.max(1),
        }
    }

    /// Record a key as delivered.
    ///
    /// Returns `false` if the key was already present (duplicate), `true`
    /// if it was newly inserted. Evicts the oldest key when full.
    pub fn insert(&mut self, key: EventKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_duplicates() {
        let mut index = DedupIndex::new(16);
        let key = EventKey::new(1, 100);

        assert!(index.insert(key));
        assert!(!index.insert(key));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn eviction_keeps_len_bounded() {
        let mut index = DedupIndex::new(3);
        for seq in 0..10 {
            index.insert(EventKey::new(1, seq));
        }

        assert_eq!(index.len(), 3);
        // Oldest keys evicted, newest retained
        assert!(!index.contains(&EventKey::new(1, 0)));
        assert!(index.contains(&EventKey::new(1, 9)));
    }

    #[test]
    fn evicted_key_can_be_reinserted() {
        let mut index = DedupIndex::new(2);
        let old = EventKey::new(1, 0);
        index.insert(old);
        index.insert(EventKey::new(1, 1));
        index.insert(EventKey::new(1, 2));

        // `old` fell out of the retention window and is treated as new again
        assert!(index.insert(old));
    }
}
