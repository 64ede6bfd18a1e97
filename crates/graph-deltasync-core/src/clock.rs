//! Vector clocks for causal ordering between delta producers.
//!
//! A vector clock maps each source to a monotonically increasing counter.
//! Two clocks are causally ordered when one dominates the other pointwise;
//! otherwise the events they stamp are concurrent.
//!
//! # References
//!
//! Fidge, "Timestamps in Message-Passing Systems That Preserve the Partial
//! Ordering" (1988); Mattern, "Virtual Time and Global States of Distributed
//! Systems" (1989)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Left happened before right
    Before,
    /// Left happened after right
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates the other
    Concurrent,
}

/// A vector clock: per-source event counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a source (zero if unseen).
    #[must_use]
    pub fn get(&self, source_id: &str) -> u64 {
        self.counters.get(source_id).copied().unwrap_or(0)
    }

    /// Increment the counter for a source and return the new value.
    pub fn increment(&mut self, source_id: &str) -> u64 {
        let counter = self.counters.entry(source_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Raise a source counter to at least `value`.
    pub fn observe(&mut self, source_id: &str, value: u64) {
        let counter = self.counters.entry(source_id.to_string()).or_insert(0);
        if value > *counter {
            *counter = value;
        }
    }

    /// Pointwise maximum with another clock.
    pub fn merge(&mut self, other: &Self) {
        for (source, &value) in &other.counters {
            self.observe(source, value);
        }
    }

    /// Compare two clocks under the causal partial order.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for source in self.counters.keys().chain(other.counters.keys()) {
            match self.get(source).cmp(&other.get(source)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Whether this clock happened strictly before `other`.
    #[must_use]
    pub fn happened_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Whether the clock holds no counters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate over `(source, counter)` pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

/// Tracks the causal clock of the local replica.
///
/// Local events tick the local source; observed remote clocks are merged in,
/// so every later local stamp dominates everything seen so far.
#[derive(Debug, Clone)]
pub struct VectorClockManager {
    local_source: String,
    clock: VectorClock,
}

impl VectorClockManager {
    /// Create a manager for the given local source.
    #[must_use]
    pub fn new(local_source: impl Into<String>) -> Self {
        Self {
            local_source: local_source.into(),
            clock: VectorClock::new(),
        }
    }

    /// The local source identifier.
    #[must_use]
    pub fn local_source(&self) -> &str {
        &self.local_source
    }

    /// Record a local event and return a snapshot of the clock.
    pub fn tick(&mut self) -> VectorClock {
        self.clock.increment(&self.local_source);
        self.clock.clone()
    }

    /// Merge a clock received from another source.
    pub fn observe(&mut self, received: &VectorClock) {
        self.clock.merge(received);
    }

    /// Counter currently known for a source.
    #[must_use]
    pub fn get(&self, source_id: &str) -> u64 {
        self.clock.get(source_id)
    }

    /// Current clock without advancing it.
    #[must_use]
    pub fn current(&self) -> &VectorClock {
        &self.clock
    }
}

/// Current wall clock time in milliseconds since UNIX epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn compare_orders() {
        let a = clock(&[("a", 1), ("b", 2)]);
        let b = clock(&[("a", 2), ("b", 2)]);
        let c = clock(&[("a", 3), ("b", 1)]);

        assert_eq!(a.compare(&b), CausalOrder::Before);
        assert_eq!(b.compare(&a), CausalOrder::After);
        assert_eq!(a.compare(&a.clone()), CausalOrder::Equal);
        assert_eq!(b.compare(&c), CausalOrder::Concurrent);
    }

    #[test]
    fn missing_entries_count_as_zero() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);

        assert!(a.happened_before(&b));
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), CausalOrder::Equal);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a = clock(&[("a", 4), ("b", 1)]);
        a.merge(&clock(&[("b", 3), ("c", 2)]));

        assert_eq!(a.get("a"), 4);
        assert_eq!(a.get("b"), 3);
        assert_eq!(a.get("c"), 2);
    }

    #[test]
    fn manager_ticks_dominate_observed() {
        let mut local = VectorClockManager::new("tab-1");
        let mut remote = VectorClockManager::new("server");

        let r1 = remote.tick();
        local.observe(&r1);
        let l1 = local.tick();

        assert!(r1.happened_before(&l1));
        assert_eq!(local.get("server"), 1);
        assert_eq!(local.get("tab-1"), 1);
    }

    #[test]
    fn clock_serializes_as_plain_map() {
        let a = clock(&[("a", 1), ("b", 7)]);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": 7}));
    }
}
