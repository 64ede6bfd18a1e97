//! Two-level duplicate detection.
//!
//! A Bloom filter answers "definitely new" cheaply; a hit is confirmed
//! against a bounded ring of exact hashes before a message is treated as a
//! duplicate. The ring holds at most half the Bloom capacity, so every
//! rebuild leaves room for at least as many new records before the next one.

use std::collections::{HashSet, VecDeque};
use xxhash_rust::xxh3::xxh3_64;

/// Fixed-size Bloom filter over byte strings.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    mask: usize,
    k: u32,
}

impl BloomFilter {
    /// Size the filter for `capacity` items at false-positive rate `fpr`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn with_capacity(capacity: usize, fpr: f64) -> Self {
        let n = capacity.max(1) as f64;
        let fpr = fpr.clamp(1e-9, 0.5);
        let m = (n * (fpr.ln().abs() / std::f64::consts::LN_2.powi(2))).ceil() as usize;
        let m = m.next_power_of_two().max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).round().max(1.0) as u32;
        Self {
            bits: vec![0; m / 64],
            mask: m - 1,
            k,
        }
    }

    fn mix64(mut x: u64) -> u64 {
        x ^= x >> 30;
        x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn positions(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h1 = xxh3_64(key);
        let h2 = Self::mix64(h1) | 1;
        (0..self.k).map(move |i| (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) as usize) & self.mask)
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<usize> = self.positions(key).collect();
        for bit in positions {
            self.bits[bit >> 6] |= 1u64 << (bit & 63);
        }
    }

    /// Whether the key may have been inserted.
    #[must_use]
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.positions(key)
            .all(|bit| self.bits[bit >> 6] & (1u64 << (bit & 63)) != 0)
    }

    /// Reset every bit.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of hash functions.
    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.k
    }
}

/// Bounded FIFO of exact hashes with set lookup.
#[derive(Debug, Clone)]
pub struct HashRing {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl HashRing {
    /// Create a ring keeping the last `capacity` hashes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a hash, evicting the oldest when full.
    pub fn insert(&mut self, hash: &str) {
        if !self.members.insert(hash.to_string()) {
            return;
        }
        self.order.push_back(hash.to_string());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    /// Whether the hash is held.
    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.members.contains(hash)
    }

    /// Held hashes, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of held hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Never seen; now recorded
    New,
    /// Confirmed by the exact ring
    Duplicate,
    /// Bloom hit not confirmed by the ring; treated as new and recorded
    FalsePositive,
}

/// Bloom filter backed by an exact ring.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    bloom: BloomFilter,
    ring: HashRing,
    capacity: usize,
    fpr: f64,
    inserted: usize,
    rebuilds: u64,
}

impl DuplicateFilter {
    /// Create a filter. `ring_capacity` is clamped to half of
    /// `bloom_capacity`.
    #[must_use]
    pub fn new(bloom_capacity: usize, fpr: f64, ring_capacity: usize) -> Self {
        let capacity = bloom_capacity.max(2);
        let ring_capacity = ring_capacity.min(capacity / 2).max(1);
        Self {
            bloom: BloomFilter::with_capacity(capacity, fpr),
            ring: HashRing::new(ring_capacity),
            capacity,
            fpr,
            inserted: 0,
            rebuilds: 0,
        }
    }

    /// Check a content hash and record it.
    pub fn check_and_insert(&mut self, hash: &str) -> FilterVerdict {
        if self.bloom.might_contain(hash.as_bytes()) {
            if self.ring.contains(hash) {
                return FilterVerdict::Duplicate;
            }
            self.record(hash);
            return FilterVerdict::FalsePositive;
        }
        self.record(hash);
        FilterVerdict::New
    }

    fn record(&mut self, hash: &str) {
        self.ring.insert(hash);
        self.bloom.insert(hash.as_bytes());
        self.inserted += 1;
        if self.inserted >= self.capacity {
            self.rebuild();
        }
    }

    /// Rebuild the Bloom filter from the ring contents.
    fn rebuild(&mut self) {
        self.bloom = BloomFilter::with_capacity(self.capacity, self.fpr);
        let hashes: Vec<String> = self.ring.iter().map(str::to_string).collect();
        for hash in &hashes {
            self.bloom.insert(hash.as_bytes());
        }
        self.inserted = hashes.len();
        self.rebuilds += 1;
        tracing::debug!(retained = self.inserted, rebuilds = self.rebuilds, "Rebuilt duplicate bloom filter");
    }

    /// Number of Bloom rebuilds so far.
    #[must_use]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Number of hashes held exactly.
    #[must_use]
    pub fn exact_len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_has_no_false_negatives() {
        let mut bloom = BloomFilter::with_capacity(1_000, 0.01);
        for i in 0..1_000 {
            bloom.insert(format!("key-{i}").as_bytes());
        }
        assert!((0..1_000).all(|i| bloom.might_contain(format!("key-{i}").as_bytes())));
        assert!(bloom.hash_count() >= 1);

        bloom.clear();
        assert!(!bloom.might_contain(b"key-1"));
    }

    #[test]
    fn bloom_false_positive_rate_is_bounded() {
        let mut bloom = BloomFilter::with_capacity(1_000, 0.01);
        for i in 0..1_000 {
            bloom.insert(format!("in-{i}").as_bytes());
        }
        let hits = (0..10_000)
            .filter(|i| bloom.might_contain(format!("out-{i}").as_bytes()))
            .count();
        assert!(hits < 500, "false positives: {hits}");
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = HashRing::new(2);
        ring.insert("a");
        ring.insert("b");
        ring.insert("a");
        ring.insert("c");

        assert!(!ring.contains("a"));
        assert!(ring.contains("b") && ring.contains("c"));
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn duplicate_needs_exact_confirmation() {
        let mut filter = DuplicateFilter::new(100, 0.01, 2);
        assert_eq!(filter.check_and_insert("h1"), FilterVerdict::New);
        assert_eq!(filter.check_and_insert("h1"), FilterVerdict::Duplicate);

        filter.check_and_insert("h2");
        filter.check_and_insert("h3");
        // h1 left the ring; the bloom still remembers it
        assert_eq!(filter.check_and_insert("h1"), FilterVerdict::FalsePositive);
    }

    #[test]
    fn rebuild_keeps_ring_members() {
        let mut filter = DuplicateFilter::new(8, 0.01, 3);
        for i in 0..10 {
            filter.check_and_insert(&format!("h{i}"));
        }
        assert_eq!(filter.rebuilds(), 1);
        assert_eq!(filter.exact_len(), 3);
        assert_eq!(filter.check_and_insert("h9"), FilterVerdict::Duplicate);
        assert_eq!(filter.check_and_insert("h0"), FilterVerdict::New);
    }

    #[test]
    fn oversized_ring_does_not_rebuild_on_every_insert() {
        let mut filter = DuplicateFilter::new(10, 0.01, 1_000);
        for i in 0..100 {
            filter.check_and_insert(&format!("h{i}"));
        }
        assert_eq!(filter.exact_len(), 5);
        assert_eq!(filter.rebuilds(), 19);
    }
}
