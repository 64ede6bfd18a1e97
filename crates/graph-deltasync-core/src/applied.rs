//! Bounded record of applied delta ids.
//!
//! Ids are kept only long enough to satisfy dependency checks of later
//! deltas. The log is bounded by capacity and by age; lookups refresh an
//! entry so the least recently used id is evicted first.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy)]
struct Entry {
    applied_at_ms: i64,
    generation: u64,
}

/// LRU-bounded set of applied delta ids.
#[derive(Debug, Clone)]
pub struct AppliedLog {
    entries: HashMap<String, Entry>,
    /// Recency queue; stale generations are skipped lazily
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    capacity: usize,
    retention_ms: i64,
}

impl AppliedLog {
    /// Create a log holding at most `capacity` ids for at most `retention_ms`.
    #[must_use]
    pub fn new(capacity: usize, retention_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
            capacity: capacity.max(1),
            retention_ms,
        }
    }

    /// Record an id as applied at `now_ms`.
    ///
    /// Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str, now_ms: i64) -> bool {
        let fresh = !self.entries.contains_key(id);
        self.bump(id, now_ms);
        self.evict(now_ms);
        fresh
    }

    /// Whether an id is recorded, without refreshing it.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether an id is recorded; refreshes its recency if so.
    pub fn touch(&mut self, id: &str) -> bool {
        let Some(applied_at_ms) = self.entries.get(id).map(|e| e.applied_at_ms) else {
            return false;
        };
        self.bump(id, applied_at_ms);
        true
    }

    /// Drop entries beyond capacity or older than the retention horizon.
    pub fn evict(&mut self, now_ms: i64) {
        while let Some((id, generation)) = self.order.front().cloned() {
            let Some(entry) = self.entries.get(&id).copied() else {
                self.order.pop_front();
                continue;
            };
            if entry.generation != generation {
                self.order.pop_front();
                continue;
            }
            let expired = now_ms.saturating_sub(entry.applied_at_ms) > self.retention_ms;
            if self.entries.len() > self.capacity || expired {
                self.order.pop_front();
                self.entries.remove(&id);
                tracing::trace!(delta_id = %id, expired, "Evicted applied id");
            } else {
                break;
            }
        }
    }

    /// Number of ids retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&mut self, id: &str, applied_at_ms: i64) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(
            id.to_string(),
            Entry {
                applied_at_ms,
                generation,
            },
        );
        self.order.push_back((id.to_string(), generation));
        // Keep the lazy queue from growing without bound under heavy touching.
        if self.order.len() > self.capacity.saturating_mul(4) {
            let entries = &self.entries;
            self.order
                .retain(|(id, generation)| entries.get(id).is_some_and(|e| e.generation == *generation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut log = AppliedLog::new(10, 60_000);
        assert!(log.insert("a", 0));
        assert!(!log.insert("a", 1));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut log = AppliedLog::new(2, 60_000);
        log.insert("a", 0);
        log.insert("b", 0);
        assert!(log.touch("a"));
        log.insert("c", 0);

        assert!(log.contains("a"));
        assert!(!log.contains("b"));
        assert!(log.contains("c"));
    }

    #[test]
    fn retention_evicts_old_entries() {
        let mut log = AppliedLog::new(100, 1_000);
        log.insert("old", 0);
        log.insert("new", 1_500);

        assert!(!log.contains("old"));
        assert!(log.contains("new"));
    }

    #[test]
    fn touch_does_not_extend_age() {
        let mut log = AppliedLog::new(100, 1_000);
        log.insert("a", 0);
        log.touch("a");
        log.evict(2_000);
        assert!(log.is_empty());
    }
}
