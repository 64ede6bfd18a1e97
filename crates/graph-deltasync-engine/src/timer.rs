//! Cancellable deadlines keyed by an arbitrary id.
//!
//! Components never spawn their own sleeps. They arm deadlines here and the
//! owner polls [`TimerSet::expire`] from one scheduler, so paused-clock tests
//! drive every time-based behavior the same way.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::time::Instant;

/// A set of pending deadlines.
#[derive(Debug, Clone)]
pub struct TimerSet<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> TimerSet<K> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a deadline, returning the previous one.
    pub fn arm(&mut self, key: K, at: Instant) -> Option<Instant> {
        self.deadlines.insert(key, at)
    }

    /// Arm a deadline only if none is pending for the key.
    pub fn arm_if_unset(&mut self, key: K, at: Instant) -> bool {
        if self.deadlines.contains_key(&key) {
            return false;
        }
        self.deadlines.insert(key, at);
        true
    }

    /// Cancel a pending deadline.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub fn is_armed(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Pending deadline of a key.
    #[must_use]
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    /// Number of pending deadlines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
