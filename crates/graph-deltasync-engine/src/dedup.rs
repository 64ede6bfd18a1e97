//! Per-source deduplication and ordered delivery.
//!
//! Every inbound [`OrderedMessage`] passes a global duplicate test and then
//! a per-source window over sequence numbers. Out-of-order messages are
//! buffered until the gap closes or its timer fires; small gaps are skipped
//! to keep delivery live, larger ones escalate to a resync a bounded number
//! of times before they are skipped too. Gaps are tracked as sequence ranges
//! derived from the buffer, so a jump in sequence numbers costs nothing.
//!
//! A source first seen far past sequence 1 is treated as a late joiner: its
//! window starts just below the first received message.

use crate::filter::{DuplicateFilter, FilterVerdict};
use crate::timer::TimerSet;
use graph_deltasync_proto::{OrderedMessage, SequenceRange};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Deduplicator configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Expected number of hashes before the Bloom filter is rebuilt
    pub bloom_capacity: usize,
    /// Target false-positive rate of the Bloom filter
    pub false_positive_rate: f64,
    /// Number of exact hashes retained for confirmation
    pub ring_capacity: usize,
    /// Maximum buffered messages per source before the window is forced
    pub window_size: usize,
    /// How long a gap may stay open
    pub gap_timeout: Duration,
    /// Most missing sequence numbers skipped on timeout; more escalate
    pub max_skippable_gap: u64,
    /// Resync requests sent for one gap before it is skipped anyway
    pub max_gap_escalations: u32,
    /// Delay before a batched acknowledgement fires
    pub ack_delay: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bloom_capacity: 10_000,
            false_positive_rate: 0.01,
            ring_capacity: 1_000,
            window_size: 100,
            gap_timeout: Duration::from_secs(5),
            max_skippable_gap: 10,
            max_gap_escalations: 3,
            ack_delay: Duration::from_millis(100),
        }
    }
}

/// How a received message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Delivered in order (possibly with buffered successors)
    Delivered,
    /// Held until earlier sequence numbers arrive
    Buffered,
    /// Same content already seen
    Duplicate,
    /// Sequence already processed
    Stale,
}

/// Result of [`MessageDeduplicator::receive`].
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Handling of the received message
    pub verdict: Verdict,
    /// Messages now deliverable, in sequence order
    pub delivered: Vec<OrderedMessage>,
}

/// Timer-driven outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupEvent {
    /// Batched acknowledgement of delivered messages
    Acknowledge {
        /// Source whose messages are acknowledged
        source_id: String,
        /// Acknowledged ids
        ids: Vec<String>,
    },
    /// A gap timed out and was skipped
    GapSkipped {
        /// Affected source
        source_id: String,
        /// Sequence ranges given up on
        missing: Vec<SequenceRange>,
        /// Messages delivered after skipping
        delivered: Vec<OrderedMessage>,
    },
    /// A gap too large to skip; full state is needed
    Resync {
        /// Affected source
        source_id: String,
        /// Sequence ranges still missing
        missing: Vec<SequenceRange>,
    },
}

/// Deduplicator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Messages received
    pub received: u64,
    /// Messages delivered
    pub delivered: u64,
    /// Duplicates suppressed
    pub duplicates: u64,
    /// Stale sequence numbers dropped
    pub stale: u64,
    /// Messages buffered out of order
    pub buffered: u64,
    /// Sequence numbers skipped
    pub skipped: u64,
    /// Bloom hits not confirmed by the exact ring
    pub false_positives: u64,
    /// Sources joined past their first sequence number
    pub late_joins: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupTimer {
    Gap(String),
    Ack(String),
}

/// Per-source ordering state.
///
/// The buffer never holds `last_processed + 1`, so a non-empty buffer means
/// at least one gap is open.
#[derive(Debug, Default)]
struct MessageWindow {
    last_processed: u64,
    buffer: BTreeMap<u64, OrderedMessage>,
    escalations: u32,
}

impl MessageWindow {
    fn next_expected(&self) -> u64 {
        self.last_processed.saturating_add(1)
    }

    /// Deliver buffered successors of `last_processed`.
    fn drain_contiguous(&mut self, out: &mut Vec<OrderedMessage>) {
        while let Some(msg) = self.buffer.remove(&self.next_expected()) {
            self.last_processed = msg.sequence_number;
            out.push(msg);
        }
        if self.buffer.is_empty() {
            self.escalations = 0;
        }
    }

    /// Missing ranges below the highest buffered sequence.
    fn gap_ranges(&self) -> Vec<SequenceRange> {
        let mut ranges = Vec::new();
        let mut cursor = self.next_expected();
        for &seq in self.buffer.keys() {
            if seq > cursor {
                ranges.push(SequenceRange::new(cursor, seq - 1));
            }
            cursor = seq.saturating_add(1);
        }
        ranges
    }

    /// Jump over the lowest gap range and return it.
    fn skip_to_next_buffered(&mut self) -> Option<SequenceRange> {
        let next = *self.buffer.keys().next()?;
        let start = self.next_expected();
        self.last_processed = next - 1;
        (next > start).then(|| SequenceRange::new(start, next - 1))
    }
}

fn missing_count(ranges: &[SequenceRange]) -> u64 {
    ranges.iter().map(SequenceRange::len).sum()
}

/// Deduplicates and orders inbound messages per source.
pub struct MessageDeduplicator {
    config: DedupConfig,
    filter: DuplicateFilter,
    windows: HashMap<String, MessageWindow>,
    outbound: HashMap<String, u64>,
    pending_acks: HashMap<String, Vec<String>>,
    timers: TimerSet<DedupTimer>,
    stats: DedupStats,
}

impl MessageDeduplicator {
    /// Create a deduplicator.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            filter: DuplicateFilter::new(config.bloom_capacity, config.false_positive_rate, config.ring_capacity),
            windows: HashMap::new(),
            outbound: HashMap::new(),
            pending_acks: HashMap::new(),
            timers: TimerSet::new(),
            stats: DedupStats::default(),
            config,
        }
    }

    /// Process one inbound message.
    pub fn receive(&mut self, msg: OrderedMessage, now: Instant) -> Receipt {
        self.stats.received += 1;

        match self.filter.check_and_insert(&msg.hash) {
            FilterVerdict::Duplicate => {
                self.stats.duplicates += 1;
                tracing::debug!(source_id = %msg.source_id, seq = msg.sequence_number, "Suppressed duplicate message");
                return Receipt {
                    verdict: Verdict::Duplicate,
                    delivered: Vec::new(),
                };
            }
            FilterVerdict::FalsePositive => self.stats.false_positives += 1,
            FilterVerdict::New => {}
        }

        let source_id = msg.source_id.clone();
        let seq = msg.sequence_number;
        let max_skippable_gap = self.config.max_skippable_gap;
        let window = self.windows.entry(source_id.clone()).or_insert_with(|| {
            let mut window = MessageWindow::default();
            if seq.saturating_sub(1) > max_skippable_gap {
                tracing::info!(source_id = %msg.source_id, seq, "Joining stream past its start");
                window.last_processed = seq - 1;
                self.stats.late_joins += 1;
            }
            window
        });

        if seq <= window.last_processed {
            self.stats.stale += 1;
            tracing::debug!(source_id = %source_id, seq, last = window.last_processed, "Dropped stale message");
            return Receipt {
                verdict: Verdict::Stale,
                delivered: Vec::new(),
            };
        }
        if window.buffer.contains_key(&seq) {
            self.stats.duplicates += 1;
            return Receipt {
                verdict: Verdict::Duplicate,
                delivered: Vec::new(),
            };
        }

        let mut delivered = Vec::new();
        let verdict = if seq == window.next_expected() {
            window.last_processed = seq;
            delivered.push(msg);
            window.drain_contiguous(&mut delivered);
            Verdict::Delivered
        } else {
            window.buffer.insert(seq, msg);
            self.stats.buffered += 1;
            tracing::debug!(source_id = %source_id, seq, buffered = window.buffer.len(), "Buffered out-of-order message");

            while window.buffer.len() > self.config.window_size {
                if let Some(skipped) = window.skip_to_next_buffered() {
                    self.stats.skipped += skipped.len();
                    tracing::warn!(source_id = %source_id, skipped = ?skipped, "Window full, forced past gap");
                }
                window.drain_contiguous(&mut delivered);
            }
            Verdict::Buffered
        };

        let gaps_open = !window.buffer.is_empty();
        let gap_key = DedupTimer::Gap(source_id.clone());
        if gaps_open {
            self.timers.arm_if_unset(gap_key, now + self.config.gap_timeout);
        } else {
            self.timers.cancel(&gap_key);
        }

        self.note_delivered(&source_id, &delivered, now);
        Receipt { verdict, delivered }
    }

    /// Fire due gap and acknowledgement timers.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<DedupEvent> {
        let mut events = Vec::new();
        for key in self.timers.expire(now) {
            match key {
                DedupTimer::Gap(source_id) => {
                    if let Some(event) = self.on_gap_timeout(&source_id, now) {
                        events.push(event);
                    }
                }
                DedupTimer::Ack(source_id) => {
                    let ids = self.pending_acks.remove(&source_id).unwrap_or_default();
                    if !ids.is_empty() {
                        events.push(DedupEvent::Acknowledge { source_id, ids });
                    }
                }
            }
        }
        events
    }

    fn on_gap_timeout(&mut self, source_id: &str, now: Instant) -> Option<DedupEvent> {
        let window = self.windows.get_mut(source_id)?;
        if window.buffer.is_empty() {
            return None;
        }

        let missing = window.gap_ranges();
        let count = missing_count(&missing);
        if count > self.config.max_skippable_gap && window.escalations < self.config.max_gap_escalations {
            window.escalations += 1;
            tracing::warn!(
                source_id,
                missing = count,
                attempt = window.escalations,
                "Gap too large to skip, requesting resync"
            );
            self.timers
                .arm(DedupTimer::Gap(source_id.to_string()), now + self.config.gap_timeout);
            return Some(DedupEvent::Resync {
                source_id: source_id.to_string(),
                missing,
            });
        }

        let mut delivered = Vec::new();
        let mut skipped = Vec::new();
        while !window.buffer.is_empty() {
            skipped.extend(window.skip_to_next_buffered());
            window.drain_contiguous(&mut delivered);
        }
        self.stats.skipped += missing_count(&skipped);
        tracing::info!(source_id, skipped = ?skipped, delivered = delivered.len(), "Gap timed out, skipped");

        self.note_delivered(source_id, &delivered, now);
        Some(DedupEvent::GapSkipped {
            source_id: source_id.to_string(),
            missing: skipped,
            delivered,
        })
    }

    /// Force-deliver buffered messages of one source, or of all sources.
    pub fn flush(&mut self, source_id: Option<&str>, now: Instant) -> Vec<OrderedMessage> {
        let sources: Vec<String> = match source_id {
            Some(id) => vec![id.to_string()],
            None => self.windows.keys().cloned().collect(),
        };

        let mut all = Vec::new();
        for source in sources {
            let Some(window) = self.windows.get_mut(&source) else {
                continue;
            };
            let buffered = std::mem::take(&mut window.buffer);
            let delivered: Vec<OrderedMessage> = buffered.into_values().collect();
            if let Some(last) = delivered.last() {
                window.last_processed = last.sequence_number;
            }
            window.escalations = 0;
            self.timers.cancel(&DedupTimer::Gap(source.clone()));
            tracing::debug!(source_id = %source, flushed = delivered.len(), "Flushed window");

            self.note_delivered(&source, &delivered, now);
            all.extend(delivered);
        }
        all
    }

    fn note_delivered(&mut self, source_id: &str, delivered: &[OrderedMessage], now: Instant) {
        self.stats.delivered += delivered.len() as u64;
        let acks: Vec<String> = delivered
            .iter()
            .filter(|m| m.ack_required)
            .map(|m| m.id.clone())
            .collect();
        if acks.is_empty() {
            return;
        }
        self.pending_acks
            .entry(source_id.to_string())
            .or_default()
            .extend(acks);
        self.timers
            .arm_if_unset(DedupTimer::Ack(source_id.to_string()), now + self.config.ack_delay);
    }

    /// Next outbound sequence number for a source, starting at 1.
    pub fn assign_sequence(&mut self, source_id: &str) -> u64 {
        let counter = self.outbound.entry(source_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Continue outbound numbering of a source after `last`. The counter
    /// never moves backwards.
    pub fn restore_sequence(&mut self, source_id: &str, last: u64) {
        let counter = self.outbound.entry(source_id.to_string()).or_insert(0);
        *counter = (*counter).max(last);
    }

    /// Highest sequence number processed for a source.
    #[must_use]
    pub fn last_processed(&self, source_id: &str) -> u64 {
        self.windows.get(source_id).map_or(0, |w| w.last_processed)
    }

    /// Open gaps of a source.
    #[must_use]
    pub fn gaps(&self, source_id: &str) -> Vec<SequenceRange> {
        self.windows.get(source_id).map(MessageWindow::gap_ranges).unwrap_or_default()
    }

    /// Number of buffered messages for a source.
    #[must_use]
    pub fn buffered(&self, source_id: &str) -> usize {
        self.windows.get(source_id).map_or(0, |w| w.buffer.len())
    }

    /// Earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        self.stats
    }
}
