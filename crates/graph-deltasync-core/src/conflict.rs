//! Causal conflict detection and resolution.
//!
//! The [`ConflictResolver`] compares local and remote deltas, classifies
//! concurrent writes to shared targets, settles them with the configured
//! [`ResolutionStrategy`], and gates application on declared dependencies.
//! A bounded window of recently applied deltas lets remote deltas be checked
//! against writes that already left the local batcher.

use crate::applied::AppliedLog;
use crate::clock::{now_ms, CausalOrder, VectorClockManager};
use crate::delta::{DeltaOperation, GraphDelta, OperationKind, TargetRef};
use crate::merge::{combine_data, fields_overlap, ResolutionStrategy};
use crate::transform::transform_delta;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Classification of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides update the same target
    WriteWrite,
    /// One side removes what the other updates
    DeleteUpdate,
    /// Any other overlap (add/add, add/remove, remove/remove)
    Structural,
}

/// Two causally unrelated deltas sharing at least one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Stable identifier (`"{local}:{remote}"`)
    pub id: String,
    /// Classification
    pub kind: ConflictKind,
    /// Delta from the local side
    pub local: GraphDelta,
    /// Delta from the remote side
    pub remote: GraphDelta,
    /// Targets both deltas touch
    pub targets: Vec<String>,
}

/// Outcome of resolving a set of conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Deltas that should be applied as-is (possibly transformed)
    pub accepted: Vec<GraphDelta>,
    /// Deltas that lost and must not be applied
    pub rejected: Vec<GraphDelta>,
    /// Combined deltas replacing both sides of a conflict
    pub merged: Vec<GraphDelta>,
    /// Conflicts deferred to the caller
    pub unresolved: Vec<Conflict>,
}

impl Resolution {
    /// Whether every conflict was settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Ids that end up applied through either accepted or merged deltas.
    #[must_use]
    pub fn applied_ids(&self) -> HashSet<String> {
        self.accepted
            .iter()
            .chain(&self.merged)
            .flat_map(|d| d.covered_ids().map(str::to_string))
            .collect()
    }
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How conflicts are settled
    pub strategy: ResolutionStrategy,
    /// Maximum number of applied ids retained for dependency checks
    pub applied_capacity: usize,
    /// How long applied ids are retained
    pub applied_retention_ms: i64,
    /// Maximum number of parked deltas awaiting dependencies
    pub max_pending: usize,
    /// Recently applied deltas kept for conflict checks against later
    /// remote deltas; also bounded by `applied_retention_ms`
    pub recent_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::default(),
            applied_capacity: 10_000,
            applied_retention_ms: 10 * 60 * 1000,
            max_pending: 1_000,
            recent_capacity: 256,
        }
    }
}

/// Result status of [`ConflictResolver::apply_delta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Applied now
    Applied,
    /// Already applied (or already parked); nothing changed
    Duplicate,
    /// Waiting on the listed dependencies
    Parked {
        /// Dependencies not yet applied
        missing: Vec<String>,
    },
}

/// Deltas that became applied as a consequence of one call.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Status of the submitted delta
    pub status: ApplyStatus,
    /// Every delta applied by this call, in application order
    pub applied: Vec<GraphDelta>,
}

/// Counters exposed by the resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverStats {
    /// Write-write conflicts detected
    pub write_write: u64,
    /// Delete-update conflicts detected
    pub delete_update: u64,
    /// Structural conflicts detected
    pub structural: u64,
    /// Conflicts settled automatically or manually
    pub resolved: u64,
    /// Conflicts deferred to the caller
    pub deferred: u64,
    /// Strategy fallbacks taken (transform → merge → lww)
    pub fallbacks: u64,
    /// Applied ids currently retained
    pub applied: usize,
    /// Parked deltas awaiting dependencies
    pub pending: usize,
    /// Parked deltas dropped for exceeding the pending bound
    pub dropped_pending: u64,
    /// Losing deltas recorded without being applied
    pub discarded: u64,
}

impl ResolverStats {
    /// Total conflicts detected.
    #[must_use]
    pub fn total_conflicts(&self) -> u64 {
        self.write_write + self.delete_update + self.structural
    }

    /// `|applied| / (|applied| + |pending|)`, or 1.0 when idle.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.applied + self.pending;
        if total == 0 {
            1.0
        } else {
            self.applied as f64 / total as f64
        }
    }
}

/// Detects, resolves, and dependency-gates graph deltas.
pub struct ConflictResolver {
    config: ResolverConfig,
    clocks: VectorClockManager,
    applied: AppliedLog,
    /// Parked deltas in arrival order
    pending: Vec<GraphDelta>,
    /// Applied deltas with their apply time, oldest first
    recent: VecDeque<(GraphDelta, i64)>,
    deferred: HashMap<String, Conflict>,
    stats: ResolverStats,
}

impl ConflictResolver {
    /// Create a resolver for the given local source.
    #[must_use]
    pub fn new(local_source: impl Into<String>, config: ResolverConfig) -> Self {
        let applied = AppliedLog::new(config.applied_capacity, config.applied_retention_ms);
        Self {
            clocks: VectorClockManager::new(local_source),
            applied,
            pending: Vec::new(),
            recent: VecDeque::new(),
            deferred: HashMap::new(),
            stats: ResolverStats::default(),
            config,
        }
    }

    /// Active strategy.
    #[must_use]
    pub fn strategy(&self) -> ResolutionStrategy {
        self.config.strategy
    }

    /// Stamp a local delta: tick the local clock and attach the snapshot to
    /// every operation that does not carry one.
    pub fn stamp(&mut self, delta: &mut GraphDelta) {
        let snapshot = self.clocks.tick();
        for op in &mut delta.operations {
            if op.vector.is_none() {
                op.vector = Some(snapshot.clone());
            }
        }
    }

    /// The local causal clock.
    #[must_use]
    pub fn clocks(&self) -> &VectorClockManager {
        &self.clocks
    }

    /// Find conflicts between local and remote deltas.
    pub fn detect_conflicts(&mut self, local: &[GraphDelta], remote: &[GraphDelta]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for l in local {
            for r in remote {
                if let Some(conflict) = self.check_pair(l, r) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    /// Find conflicts among unordered pairs of a single set.
    pub fn detect_within(&mut self, deltas: &[GraphDelta]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for (i, a) in deltas.iter().enumerate() {
            for b in &deltas[i + 1..] {
                if let Some(conflict) = self.check_pair(a, b) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    fn check_pair(&mut self, local: &GraphDelta, remote: &GraphDelta) -> Option<Conflict> {
        if local.id == remote.id || local.depends_on(&remote.id) || remote.depends_on(&local.id) {
            return None;
        }

        let (lc, rc) = (local.clock(), remote.clock());
        if !lc.is_empty() && !rc.is_empty() {
            if let CausalOrder::Before | CausalOrder::After = lc.compare(&rc) {
                return None;
            }
        }

        let shared: BTreeSet<TargetRef> = local
            .targets()
            .intersection(&remote.targets())
            .cloned()
            .collect();
        if shared.is_empty() {
            return None;
        }

        let kind = classify(local, remote, &shared);
        match kind {
            ConflictKind::WriteWrite => self.stats.write_write += 1,
            ConflictKind::DeleteUpdate => self.stats.delete_update += 1,
            ConflictKind::Structural => self.stats.structural += 1,
        }

        tracing::debug!(
            local_id = %local.id,
            remote_id = %remote.id,
            kind = ?kind,
            shared = shared.len(),
            "Detected conflict"
        );

        Some(Conflict {
            id: format!("{}:{}", local.id, remote.id),
            kind,
            local: local.clone(),
            remote: remote.clone(),
            targets: shared.iter().map(ToString::to_string).collect(),
        })
    }

    /// Resolve conflicts with the configured strategy.
    pub fn resolve(&mut self, conflicts: Vec<Conflict>) -> Resolution {
        let mut resolution = Resolution::default();

        for conflict in conflicts {
            match self.config.strategy {
                ResolutionStrategy::LastWriterWins => {
                    self.pick_winner(&conflict, true, &mut resolution);
                }
                ResolutionStrategy::FirstWriterWins => {
                    self.pick_winner(&conflict, false, &mut resolution);
                }
                ResolutionStrategy::Merge => self.merge_or_fallback(&conflict, &mut resolution),
                ResolutionStrategy::OperationalTransform => {
                    let (earlier, later) = writer_order(&conflict.local, &conflict.remote);
                    match transform_delta(later, earlier) {
                        Ok(transformed) => {
                            self.stats.resolved += 1;
                            resolution.accepted.push(earlier.clone());
                            resolution.accepted.push(transformed);
                        }
                        Err(err) => {
                            tracing::debug!(conflict_id = %conflict.id, error = %err, "Transform failed, falling back to merge");
                            self.stats.fallbacks += 1;
                            self.merge_or_fallback(&conflict, &mut resolution);
                        }
                    }
                }
                ResolutionStrategy::UserIntervention => {
                    self.stats.deferred += 1;
                    tracing::info!(conflict_id = %conflict.id, kind = ?conflict.kind, "Conflict deferred to caller");
                    self.deferred.insert(conflict.id.clone(), conflict.clone());
                    resolution.unresolved.push(conflict);
                }
            }
        }

        finalize(resolution)
    }

    /// Conflicts awaiting a manual decision.
    pub fn deferred(&self) -> impl Iterator<Item = &Conflict> {
        self.deferred.values()
    }

    /// Settle a deferred conflict by naming the winning delta id.
    ///
    /// # Errors
    ///
    /// Returns error if the conflict is unknown or the winner is not one of
    /// its two deltas.
    pub fn resolve_deferred(&mut self, conflict_id: &str, winner_id: &str) -> Result<Resolution, ConflictError> {
        let conflict = self
            .deferred
            .get(conflict_id)
            .ok_or_else(|| ConflictError::UnknownConflict(conflict_id.to_string()))?;

        let (winner, loser) = if conflict.local.id == winner_id {
            (conflict.local.clone(), conflict.remote.clone())
        } else if conflict.remote.id == winner_id {
            (conflict.remote.clone(), conflict.local.clone())
        } else {
            return Err(ConflictError::InvalidWinner {
                conflict_id: conflict_id.to_string(),
                winner_id: winner_id.to_string(),
            });
        };

        self.deferred.remove(conflict_id);
        self.stats.resolved += 1;
        Ok(Resolution {
            accepted: vec![winner],
            rejected: vec![loser],
            ..Resolution::default()
        })
    }

    fn pick_winner(&mut self, conflict: &Conflict, later_wins: bool, out: &mut Resolution) {
        let (earlier, later) = writer_order(&conflict.local, &conflict.remote);
        let (winner, loser) = if later_wins { (later, earlier) } else { (earlier, later) };
        self.stats.resolved += 1;
        out.accepted.push(winner.clone());
        out.rejected.push(loser.clone());
    }

    fn merge_or_fallback(&mut self, conflict: &Conflict, out: &mut Resolution) {
        if let Some(merged) = try_merge(&conflict.local, &conflict.remote) {
            self.stats.resolved += 1;
            tracing::debug!(conflict_id = %conflict.id, merged_id = %merged.id, "Merged concurrent deltas");
            out.merged.push(merged);
        } else {
            self.stats.fallbacks += 1;
            self.pick_winner(conflict, true, out);
        }
    }

    /// Apply a delta once all of its dependencies are applied.
    ///
    /// Re-applying a known id is a no-op. A delta with unmet dependencies is
    /// parked; every successful apply drains parked deltas that became ready.
    pub fn apply_delta(&mut self, delta: GraphDelta) -> ApplyOutcome {
        let now = now_ms();
        self.applied.evict(now);

        if self.applied.contains(&delta.id) || self.pending.iter().any(|p| p.id == delta.id) {
            tracing::debug!(delta_id = %delta.id, "Skipping already seen delta");
            return ApplyOutcome {
                status: ApplyStatus::Duplicate,
                applied: Vec::new(),
            };
        }

        let missing = self.missing_dependencies(&delta);
        if !missing.is_empty() {
            tracing::debug!(delta_id = %delta.id, missing = ?missing, "Parking delta until dependencies apply");
            self.park(delta);
            self.refresh_counts();
            return ApplyOutcome {
                status: ApplyStatus::Parked { missing },
                applied: Vec::new(),
            };
        }

        let mut applied = vec![self.commit(delta, now)];
        self.drain_ready(now, &mut applied);
        self.refresh_counts();

        ApplyOutcome {
            status: ApplyStatus::Applied,
            applied,
        }
    }

    /// Record a losing delta as settled without applying it.
    ///
    /// Its ids count as applied for dependency checks and duplicate
    /// suppression, and its clock is observed, but the delta itself is never
    /// returned. Returns parked deltas that became ready.
    pub fn discard(&mut self, delta: &GraphDelta) -> Vec<GraphDelta> {
        let now = now_ms();
        self.applied.evict(now);
        self.pending.retain(|p| p.id != delta.id);
        for id in delta.covered_ids() {
            self.applied.insert(id, now);
        }
        self.clocks.observe(&delta.clock());
        self.stats.discarded += 1;
        tracing::debug!(delta_id = %delta.id, source_id = %delta.source_id, "Discarded losing delta");

        let mut applied = Vec::new();
        self.drain_ready(now, &mut applied);
        self.refresh_counts();
        applied
    }

    /// Recently applied deltas, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &GraphDelta> {
        self.recent.iter().map(|(delta, _)| delta)
    }

    /// Whether an id is recorded as applied.
    #[must_use]
    pub fn is_applied(&self, id: &str) -> bool {
        self.applied.contains(id)
    }

    /// Parked deltas in arrival order.
    #[must_use]
    pub fn pending(&self) -> &[GraphDelta] {
        &self.pending
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        self.stats.clone()
    }

    fn missing_dependencies(&mut self, delta: &GraphDelta) -> Vec<String> {
        delta
            .dependencies
            .iter()
            .filter(|dep| !self.applied.touch(dep))
            .cloned()
            .collect()
    }

    fn park(&mut self, delta: GraphDelta) {
        self.pending.push(delta);
        while self.pending.len() > self.config.max_pending {
            let dropped = self.pending.remove(0);
            self.stats.dropped_pending += 1;
            tracing::warn!(delta_id = %dropped.id, "Dropped parked delta beyond pending bound");
        }
    }

    fn commit(&mut self, delta: GraphDelta, now: i64) -> GraphDelta {
        for id in delta.covered_ids() {
            self.applied.insert(id, now);
        }
        self.clocks.observe(&delta.clock());
        tracing::debug!(delta_id = %delta.id, source_id = %delta.source_id, ops = delta.operations.len(), "Applied delta");

        self.recent.push_back((delta.clone(), now));
        while let Some(&(_, applied_at)) = self.recent.front() {
            let expired = now.saturating_sub(applied_at) > self.config.applied_retention_ms;
            if self.recent.len() <= self.config.recent_capacity && !expired {
                break;
            }
            self.recent.pop_front();
        }
        delta
    }

    fn drain_ready(&mut self, now: i64, applied: &mut Vec<GraphDelta>) {
        loop {
            let ready = self
                .pending
                .iter()
                .position(|p| p.dependencies.iter().all(|dep| self.applied.contains(dep)));
            let Some(index) = ready else {
                break;
            };
            let delta = self.pending.remove(index);
            if self.applied.contains(&delta.id) {
                continue;
            }
            applied.push(self.commit(delta, now));
        }
    }

    fn refresh_counts(&mut self) {
        self.stats.applied = self.applied.len();
        self.stats.pending = self.pending.len();
    }
}

/// Classify the overlap of two deltas on their shared targets.
fn classify(a: &GraphDelta, b: &GraphDelta, shared: &BTreeSet<TargetRef>) -> ConflictKind {
    let kinds_on = |delta: &GraphDelta, target: &TargetRef| -> HashSet<OperationKind> {
        delta
            .operations
            .iter()
            .filter(|op| op.target_ref() == *target)
            .map(|op| op.kind)
            .collect()
    };

    let mut write_write = false;
    for target in shared {
        let (ka, kb) = (kinds_on(a, target), kinds_on(b, target));
        let a_removes = ka.contains(&OperationKind::Remove);
        let b_removes = kb.contains(&OperationKind::Remove);
        let a_updates = ka.contains(&OperationKind::Update);
        let b_updates = kb.contains(&OperationKind::Update);

        if (a_removes && b_updates) || (b_removes && a_updates) {
            return ConflictKind::DeleteUpdate;
        }
        if a_updates && b_updates {
            write_write = true;
        }
    }

    if write_write {
        ConflictKind::WriteWrite
    } else {
        ConflictKind::Structural
    }
}

/// Order two deltas by (timestamp, source id, id).
fn writer_order<'a>(a: &'a GraphDelta, b: &'a GraphDelta) -> (&'a GraphDelta, &'a GraphDelta) {
    let ord = a
        .timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.id.cmp(&b.id));
    match ord {
        Ordering::Greater => (b, a),
        Ordering::Less | Ordering::Equal => (a, b),
    }
}

/// Combine two deltas field by field.
///
/// Fails when a shared target is removed on either side or when any pair of
/// operations on a shared target writes overlapping field paths.
fn try_merge(a: &GraphDelta, b: &GraphDelta) -> Option<GraphDelta> {
    let (base, overlay) = writer_order(a, b);
    let shared: BTreeSet<TargetRef> = base.targets().intersection(&overlay.targets()).cloned().collect();

    for target in &shared {
        let left: Vec<&DeltaOperation> = base.operations.iter().filter(|op| op.target_ref() == *target).collect();
        let right: Vec<&DeltaOperation> = overlay.operations.iter().filter(|op| op.target_ref() == *target).collect();

        let removes = left.iter().chain(&right).any(|op| op.kind == OperationKind::Remove);
        if removes {
            return None;
        }
        if left.iter().any(|l| right.iter().any(|r| fields_overlap(l, r))) {
            return None;
        }
    }

    let mut operations = base.operations.clone();
    for op in &overlay.operations {
        let target = op.target_ref();
        let slot = shared
            .contains(&target)
            .then(|| operations.iter().position(|existing| existing.target_ref() == target))
            .flatten();

        match slot {
            Some(index) => {
                let existing = &operations[index];
                let (path, data) = combine_data(existing, op);
                let kind = if existing.kind == OperationKind::Add || op.kind == OperationKind::Add {
                    OperationKind::Add
                } else {
                    OperationKind::Update
                };
                let mut vector = existing.vector.clone().unwrap_or_default();
                if let Some(other) = &op.vector {
                    vector.merge(other);
                }
                let combined = &mut operations[index];
                combined.kind = kind;
                combined.path = path;
                combined.data = Some(data);
                combined.vector = (!vector.is_empty()).then_some(vector);
            }
            None => operations.push(op.clone()),
        }
    }

    let covered: Vec<String> = base
        .covered_ids()
        .chain(overlay.covered_ids())
        .map(str::to_string)
        .collect();
    let mut dependencies: Vec<String> = Vec::new();
    for dep in base.dependencies.iter().chain(&overlay.dependencies) {
        if !covered.contains(dep) && !dependencies.contains(dep) {
            dependencies.push(dep.clone());
        }
    }

    Some(GraphDelta {
        id: merged_id(&base.id, &overlay.id),
        timestamp: base.timestamp.max(overlay.timestamp),
        operations,
        version: overlay.version.clone(),
        source_id: overlay.source_id.clone(),
        dependencies,
        merged_from: covered,
    })
}

/// Deterministic id for the merge of two deltas, identical on every replica.
fn merged_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(first.as_bytes());
    hasher.update(&[0]);
    hasher.update(second.as_bytes());
    format!("merge-{}", &hasher.finalize().to_hex()[..16])
}

/// Drop duplicates and make sure a rejected or merged-away id is never
/// also accepted.
fn finalize(mut resolution: Resolution) -> Resolution {
    let rejected: HashSet<String> = resolution.rejected.iter().map(|d| d.id.clone()).collect();
    let merged_away: HashSet<String> = resolution
        .merged
        .iter()
        .flat_map(|d| d.merged_from.iter().cloned())
        .collect();

    let mut seen = HashSet::new();
    resolution.accepted.retain(|d| {
        !rejected.contains(&d.id) && !merged_away.contains(&d.id) && seen.insert(d.id.clone())
    });

    let mut seen = HashSet::new();
    resolution.merged.retain(|d| seen.insert(d.id.clone()));
    let mut seen = HashSet::new();
    resolution.rejected.retain(|d| seen.insert(d.id.clone()));

    resolution
}

/// Errors from manual conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    /// No deferred conflict with this id
    #[error("unknown conflict: {0}")]
    UnknownConflict(String),
    /// The named winner is not part of the conflict
    #[error("delta {winner_id} is not part of conflict {conflict_id}")]
    InvalidWinner {
        /// Conflict id
        conflict_id: String,
        /// Offending winner id
        winner_id: String,
    },
}
