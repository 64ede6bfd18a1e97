//! Priority batching of outbound deltas.
//!
//! Local deltas accumulate until a timer fires, the size limit is reached,
//! or a high-priority update arrives. Processing a batch folds same-source
//! deltas together, resolves conflicts among the rest, and compresses the
//! payload once it is large enough to be worth it.

use crate::compression::{CompressionError, DeltaCompressor};
use crate::timer::TimerSet;
use graph_deltasync_core::{Conflict, ConflictResolver, GraphDelta, OperationKind, TargetRef};
use graph_deltasync_proto::CompressedDelta;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Priority assigned to each operation kind.
#[derive(Debug, Clone, Copy)]
pub struct OperationPriorities {
    /// Priority of a remove
    pub remove: u8,
    /// Priority of an add
    pub add: u8,
    /// Priority of an update
    pub update: u8,
}

impl Default for OperationPriorities {
    fn default() -> Self {
        Self {
            remove: 3,
            add: 2,
            update: 1,
        }
    }
}

impl OperationPriorities {
    /// Priority of one operation kind.
    #[must_use]
    pub fn of(&self, kind: OperationKind) -> u8 {
        match kind {
            OperationKind::Remove => self.remove,
            OperationKind::Add => self.add,
            OperationKind::Update => self.update,
        }
    }
}

/// Batcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Pending updates that force immediate processing
    pub max_batch_size: usize,
    /// Delay after the latest update before processing
    pub batch_delay: Duration,
    /// Upper bound after the first pending update
    pub max_batch_delay: Duration,
    /// Submission priority that skips the timer
    pub immediate_priority: u8,
    /// Same-source deltas closer than this (ms) may be folded together
    pub merge_window_ms: i64,
    /// Serialized size above which a batch is compressed
    pub compression_threshold: usize,
    /// Per-operation priorities
    pub priorities: OperationPriorities,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_delay: Duration::from_millis(50),
            max_batch_delay: Duration::from_millis(500),
            immediate_priority: 3,
            merge_window_ms: 100,
            compression_threshold: 1024,
            priorities: OperationPriorities::default(),
        }
    }
}

/// What happened to a submitted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Id already pending or in the active batch
    Ignored,
    /// Waiting for the batch timer
    Queued,
    /// The batch should be processed now
    Ready,
}

/// Batch contents.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPayload {
    /// Deltas as-is
    Plain(Vec<GraphDelta>),
    /// Compressed list of deltas
    Compressed {
        /// Encoded payload
        data: CompressedDelta,
        /// The deltas it encodes, kept for retransmission
        deltas: Vec<GraphDelta>,
    },
}

/// A processed batch ready for emission.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    /// Batch identifier
    pub id: String,
    /// Highest operation priority in the batch
    pub priority: u8,
    /// Resolved deltas
    pub payload: BatchPayload,
    /// Ids of the emitted deltas
    pub delta_ids: Vec<String>,
    /// Conflicts deferred to the caller
    pub unresolved: Vec<Conflict>,
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    delta: GraphDelta,
    priority: u8,
}

/// Collects local deltas into prioritized batches.
pub struct UpdateBatcher {
    config: BatcherConfig,
    source_id: String,
    pending: Vec<PendingUpdate>,
    active: HashSet<String>,
    first_pending_at: Option<Instant>,
    timer: TimerSet<()>,
}

impl UpdateBatcher {
    /// Create a batcher for deltas of `source_id`.
    #[must_use]
    pub fn new(source_id: impl Into<String>, config: BatcherConfig) -> Self {
        Self {
            config,
            source_id: source_id.into(),
            pending: Vec::new(),
            active: HashSet::new(),
            first_pending_at: None,
            timer: TimerSet::new(),
        }
    }

    /// Queue a delta.
    pub fn add_update(&mut self, delta: GraphDelta, priority: u8, now: Instant) -> AddOutcome {
        if self.active.contains(&delta.id) || self.pending.iter().any(|p| p.delta.id == delta.id) {
            tracing::debug!(delta_id = %delta.id, "Ignoring update already batched");
            return AddOutcome::Ignored;
        }

        self.pending.push(PendingUpdate { delta, priority });
        let first = *self.first_pending_at.get_or_insert(now);

        if priority >= self.config.immediate_priority || self.pending.len() >= self.config.max_batch_size {
            self.timer.cancel(&());
            return AddOutcome::Ready;
        }

        let deadline = (now + self.config.batch_delay).min(first + self.config.max_batch_delay);
        self.timer.arm((), deadline);
        AddOutcome::Queued
    }

    /// Whether the batch timer fired.
    pub fn poll_timer(&mut self, now: Instant) -> bool {
        !self.timer.expire(now).is_empty()
    }

    /// Deadline of the batch timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.next_deadline()
    }

    /// Deltas waiting for the next batch, in submission order.
    #[must_use]
    pub fn pending_deltas(&self) -> Vec<GraphDelta> {
        self.pending.iter().map(|p| p.delta.clone()).collect()
    }

    /// Number of pending updates.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop a pending delta. Returns whether it was pending.
    pub fn withdraw(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.delta.id != id);
        if self.pending.is_empty() {
            self.first_pending_at = None;
            self.timer.cancel(&());
        }
        before != self.pending.len()
    }

    /// Replace a pending delta with a rewritten version of the same id.
    pub fn replace(&mut self, delta: GraphDelta) -> bool {
        match self.pending.iter_mut().find(|p| p.delta.id == delta.id) {
            Some(slot) => {
                slot.delta = delta;
                true
            }
            None => false,
        }
    }

    /// Build the next batch from pending updates.
    ///
    /// # Errors
    ///
    /// Returns error if compression of a large batch fails.
    pub async fn process_batch(
        &mut self,
        resolver: &mut ConflictResolver,
        compressor: &mut DeltaCompressor,
        now: Instant,
    ) -> Result<Option<UpdateBatch>, CompressionError> {
        self.timer.cancel(&());
        if self.pending.is_empty() {
            self.first_pending_at = None;
            return Ok(None);
        }

        self.pending.sort_by(|a, b| b.priority.cmp(&a.priority));
        let take = self.pending.len().min(self.config.max_batch_size);
        let taken: Vec<GraphDelta> = self.pending.drain(..take).map(|p| p.delta).collect();
        if self.pending.is_empty() {
            self.first_pending_at = None;
        } else {
            self.first_pending_at = Some(now);
            self.timer.arm((), now + self.config.batch_delay);
        }
        self.active = taken.iter().map(|d| d.id.clone()).collect();

        let submitted = taken.len();
        let folded = self.fold_same_source(taken);
        let conflicts = resolver.detect_within(&folded);
        let involved: HashSet<String> = conflicts
            .iter()
            .flat_map(|c| [c.local.id.clone(), c.remote.id.clone()])
            .collect();
        let resolution = resolver.resolve(conflicts);

        let mut deltas: Vec<GraphDelta> = folded.into_iter().filter(|d| !involved.contains(&d.id)).collect();
        deltas.extend(resolution.accepted);
        deltas.extend(resolution.merged);

        let priority = self.batch_priority(&deltas);
        let delta_ids: Vec<String> = deltas.iter().map(|d| d.id.clone()).collect();
        let size = serde_json::to_vec(&deltas).map_or(0, |bytes| bytes.len());

        let payload = if size > self.config.compression_threshold {
            let data = compressor.compress_batch(&self.source_id, deltas.clone()).await?;
            BatchPayload::Compressed { data, deltas }
        } else {
            BatchPayload::Plain(deltas)
        };

        tracing::debug!(
            submitted,
            emitted = delta_ids.len(),
            unresolved = resolution.unresolved.len(),
            priority,
            size,
            compressed = matches!(payload, BatchPayload::Compressed { .. }),
            "Processed batch"
        );

        Ok(Some(UpdateBatch {
            id: Uuid::new_v4().to_string(),
            priority,
            payload,
            delta_ids,
            unresolved: resolution.unresolved,
        }))
    }

    /// Fold same-source deltas that are close in time and touch disjoint
    /// targets into single deltas.
    fn fold_same_source(&self, deltas: Vec<GraphDelta>) -> Vec<GraphDelta> {
        let mut out: Vec<(GraphDelta, BTreeSet<TargetRef>)> = Vec::new();

        for delta in deltas {
            let targets = delta.targets();
            let slot = out.iter().position(|(group, group_targets)| {
                group.source_id == delta.source_id
                    && (group.timestamp - delta.timestamp).abs() <= self.config.merge_window_ms
                    && group_targets.is_disjoint(&targets)
            });

            match slot {
                Some(index) => {
                    let (group, group_targets) = &mut out[index];
                    group.merged_from.extend(delta.covered_ids().map(str::to_string));
                    group.operations.extend(delta.operations);
                    group.timestamp = group.timestamp.max(delta.timestamp);
                    for dep in delta.dependencies {
                        if !group.depends_on(&dep) {
                            group.dependencies.push(dep);
                        }
                    }
                    let covered: HashSet<String> = group.covered_ids().map(str::to_string).collect();
                    group.dependencies.retain(|d| !covered.contains(d));
                    group_targets.extend(targets);
                }
                None => out.push((delta, targets)),
            }
        }

        out.into_iter().map(|(delta, _)| delta).collect()
    }

    fn batch_priority(&self, deltas: &[GraphDelta]) -> u8 {
        deltas
            .iter()
            .flat_map(|d| &d.operations)
            .map(|op| self.config.priorities.of(op.kind))
            .max()
            .unwrap_or(0)
    }
}
