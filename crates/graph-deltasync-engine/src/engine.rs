//! Sync engine wiring resolver, deduplicator, batcher, compressor and queue.
//!
//! Local deltas are stamped, applied, batched and handed to the offline
//! queue. Inbound messages are verified, deduplicated, decoded, reconciled
//! against pending and recently applied deltas, and applied through a
//! [`GraphSink`].
//!
//! Emitted messages are kept in a bounded retransmit log. A resync request
//! for an open gap is answered with the original messages; a request for
//! messages the receiver already dropped or skipped is answered by emitting
//! their deltas again under a fresh sequence number.

use crate::batcher::{AddOutcome, BatchPayload, BatcherConfig, UpdateBatch, UpdateBatcher};
use crate::compression::{CompressionConfig, CompressionError, DeltaCompressor};
use crate::dedup::{DedupConfig, DedupEvent, DedupStats, MessageDeduplicator};
use crate::queue::{OfflineQueueManager, QueueConfig, QueueError};
use crate::store::QueueStore;
use crate::transport::Transport;
use graph_deltasync_core::{
    now_ms, ConflictError, ConflictResolver, GraphDelta, Resolution, ResolverConfig, ResolverStats,
};
use graph_deltasync_proto::{
    AckBatch, MessageError, OrderedMessage, Payload, QueuedMessage, ResyncReason, ResyncRequest, SequenceRange,
    WireMessage,
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Priority given to merged deltas resubmitted for emission.
const RESUBMIT_PRIORITY: u8 = 1;

/// Receives every applied delta, local or remote.
pub trait GraphSink: Send {
    /// Apply a delta to the application graph.
    fn apply(&mut self, delta: &GraphDelta);
}

impl<F> GraphSink for F
where
    F: FnMut(&GraphDelta) + Send,
{
    fn apply(&mut self, delta: &GraphDelta) {
        self(delta);
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local source identifier
    pub source_id: String,
    /// Conflict resolver settings
    pub resolver: ResolverConfig,
    /// Deduplicator settings
    pub dedup: DedupConfig,
    /// Compressor settings
    pub compression: CompressionConfig,
    /// Batcher settings
    pub batcher: BatcherConfig,
    /// Offline queue settings
    pub queue: QueueConfig,
    /// Ask the sender for state after skipping a gap
    pub request_retransmit_on_skip: bool,
    /// Emitted messages kept for answering resync requests
    pub retransmit_capacity: usize,
}

impl EngineConfig {
    /// Defaults for a source.
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            resolver: ResolverConfig::default(),
            dedup: DedupConfig::default(),
            compression: CompressionConfig::default(),
            batcher: BatcherConfig::default(),
            queue: QueueConfig::default(),
            request_retransmit_on_skip: true,
            retransmit_capacity: 256,
        }
    }
}

/// A local delta submitted through [`SyncEngine::run`].
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    /// The delta
    pub delta: GraphDelta,
    /// Batching priority
    pub priority: u8,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Local deltas submitted
    pub submitted: u64,
    /// Batches handed to the queue
    pub batches: u64,
    /// Deltas applied from remote sources
    pub remote_applied: u64,
    /// Inbound messages dropped for a bad hash or payload
    pub rejected: u64,
    /// Resync requests sent
    pub resyncs_requested: u64,
    /// Resync requests served
    pub resyncs_served: u64,
    /// Messages sent again, original or re-encoded
    pub retransmitted: u64,
}

/// Errors from the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Batch compression failed
    #[error(transparent)]
    Compression(#[from] CompressionError),
    /// The offline queue failed
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A message could not be built
    #[error(transparent)]
    Message(#[from] MessageError),
    /// A deferred conflict could not be settled
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// An emitted message and the deltas it carries.
#[derive(Debug, Clone)]
struct SentMessage {
    message: OrderedMessage,
    deltas: Vec<GraphDelta>,
    priority: u8,
}

/// Delta synchronization engine for one local source.
pub struct SyncEngine {
    source_id: String,
    request_retransmit_on_skip: bool,
    retransmit_capacity: usize,
    retransmit: BTreeMap<u64, SentMessage>,
    sequence_restored: bool,
    resolver: ConflictResolver,
    dedup: MessageDeduplicator,
    compressor: DeltaCompressor,
    batcher: UpdateBatcher,
    queue: Arc<OfflineQueueManager>,
    transport: Arc<dyn Transport>,
    sink: Box<dyn GraphSink>,
    stats: EngineStats,
}

impl SyncEngine {
    /// Create an engine. The queue starts offline.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        sink: impl GraphSink + 'static,
    ) -> Self {
        let queue = OfflineQueueManager::new(store, Arc::clone(&transport), config.queue);
        Self {
            resolver: ConflictResolver::new(config.source_id.clone(), config.resolver),
            dedup: MessageDeduplicator::new(config.dedup),
            compressor: DeltaCompressor::new(config.compression),
            batcher: UpdateBatcher::new(config.source_id.clone(), config.batcher),
            source_id: config.source_id,
            request_retransmit_on_skip: config.request_retransmit_on_skip,
            retransmit_capacity: config.retransmit_capacity,
            retransmit: BTreeMap::new(),
            sequence_restored: false,
            queue,
            transport,
            sink: Box::new(sink),
            stats: EngineStats::default(),
        }
    }

    /// Local source identifier.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The outbound queue; use it to switch connectivity.
    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueueManager> {
        &self.queue
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Resolver counters.
    #[must_use]
    pub fn resolver_stats(&self) -> ResolverStats {
        self.resolver.stats()
    }

    /// Deduplicator counters.
    #[must_use]
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Ids of conflicts waiting for [`SyncEngine::resolve_deferred`].
    #[must_use]
    pub fn deferred_conflicts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resolver.deferred().map(|c| c.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Submit a local delta.
    ///
    /// # Errors
    ///
    /// Returns error if an immediate batch cannot be built or queued.
    pub async fn submit_local(&mut self, mut delta: GraphDelta, priority: u8, now: Instant) -> Result<(), EngineError> {
        self.stats.submitted += 1;
        self.resolver.stamp(&mut delta);
        let outcome = self.resolver.apply_delta(delta.clone());
        self.deliver(&outcome.applied);

        if self.batcher.add_update(delta, priority, now) == AddOutcome::Ready {
            self.flush_batch(now).await?;
        }
        Ok(())
    }

    /// Build and queue the next batch, if any.
    ///
    /// # Errors
    ///
    /// Returns error if compression or queueing fails.
    pub async fn flush_batch(&mut self, now: Instant) -> Result<(), EngineError> {
        if let Some(batch) = self
            .batcher
            .process_batch(&mut self.resolver, &mut self.compressor, now)
            .await?
        {
            self.emit(batch).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, batch: UpdateBatch) -> Result<(), EngineError> {
        for conflict in &batch.unresolved {
            tracing::warn!(conflict_id = %conflict.id, "Local conflict deferred, withheld from batch");
        }

        let (payload, deltas) = match batch.payload {
            BatchPayload::Plain(deltas) if deltas.is_empty() => return Ok(()),
            BatchPayload::Plain(deltas) => (plain_payload(deltas.clone()), deltas),
            BatchPayload::Compressed { data, deltas } => (Payload::Compressed(data), deltas),
        };

        tracing::debug!(batch_id = %batch.id, deltas = batch.delta_ids.len(), "Emitting batch");
        self.enqueue_payload(payload, deltas, batch.priority).await?;
        self.stats.batches += 1;
        Ok(())
    }

    /// Sequence, log and queue one payload.
    async fn enqueue_payload(&mut self, payload: Payload, deltas: Vec<GraphDelta>, priority: u8) -> Result<(), EngineError> {
        let sequence = self.next_sequence().await?;
        let message = OrderedMessage::new(
            self.source_id.clone(),
            sequence,
            payload.message_type(),
            payload.to_value()?,
            now_ms(),
        )
        .with_ack();
        let record = QueuedMessage::from_ordered(&message, priority)?;

        tracing::debug!(
            message_id = %message.id,
            sequence,
            deltas = deltas.len(),
            message_type = %message.message_type,
            "Queueing ordered message"
        );
        self.retransmit.insert(
            sequence,
            SentMessage {
                message,
                deltas,
                priority,
            },
        );
        while self.retransmit.len() > self.retransmit_capacity {
            self.retransmit.pop_first();
        }
        self.queue.enqueue(record).await?;
        Ok(())
    }

    /// Assign the next outbound sequence number and persist it.
    ///
    /// The first call continues from the number saved by an earlier run, so
    /// a restarted source is not taken for a replay by its peers.
    async fn next_sequence(&mut self) -> Result<u64, EngineError> {
        if !self.sequence_restored {
            if let Some(last) = self.queue.last_sequence(&self.source_id).await? {
                tracing::info!(source_id = %self.source_id, last, "Continuing outbound sequence");
                self.dedup.restore_sequence(&self.source_id, last);
            }
            self.sequence_restored = true;
        }
        let sequence = self.dedup.assign_sequence(&self.source_id);
        self.queue.save_sequence(&self.source_id, sequence).await?;
        Ok(sequence)
    }

    /// Handle one inbound wire message.
    ///
    /// Malformed or corrupted payloads are dropped and logged; errors are
    /// returned only for local failures.
    ///
    /// # Errors
    ///
    /// Returns error if the queue or a resubmitted batch fails.
    pub async fn handle_inbound(&mut self, message: WireMessage, now: Instant) -> Result<(), EngineError> {
        match message {
            WireMessage::Ordered(ordered) => self.receive_ordered(ordered, now).await,
            WireMessage::Group(group) => {
                for record in group.messages {
                    match record.to_ordered() {
                        Ok(ordered) => self.receive_ordered(ordered, now).await?,
                        Err(e) => {
                            self.stats.rejected += 1;
                            tracing::warn!(record_id = %record.id, error = %e, "Dropping undecodable queue record");
                        }
                    }
                }
                Ok(())
            }
            WireMessage::Ack(ack) => {
                if ack.source_id == self.source_id {
                    self.queue.acknowledge(&ack.ids).await?;
                }
                Ok(())
            }
            WireMessage::Resync(request) => {
                if request.source_id == self.source_id {
                    self.serve_resync(request).await?;
                }
                Ok(())
            }
        }
    }

    /// Answer a resync request for the local stream.
    ///
    /// The next compressed payload is sent fresh. Messages behind an open gap
    /// are sent again unchanged; messages the receiver dropped or skipped are
    /// emitted again as a plain payload with a new sequence number.
    async fn serve_resync(&mut self, request: ResyncRequest) -> Result<(), EngineError> {
        tracing::info!(
            requester_id = %request.requester_id,
            reason = ?request.reason,
            missing = ?request.missing,
            "Resync requested"
        );
        self.compressor.reset_sent(&self.source_id);
        self.stats.resyncs_served += 1;

        let mut found: Vec<SentMessage> = Vec::new();
        let mut unavailable = 0u64;
        for range in &request.missing {
            let held: Vec<SentMessage> = self
                .retransmit
                .range(range.start..=range.end)
                .map(|(_, sent)| sent.clone())
                .collect();
            unavailable += range.len().saturating_sub(held.len() as u64);
            found.extend(held);
        }
        if unavailable > 0 {
            tracing::warn!(
                requester_id = %request.requester_id,
                unavailable,
                "Requested messages are no longer held for retransmission"
            );
        }
        if found.is_empty() {
            return Ok(());
        }

        if request.reason == ResyncReason::Gap {
            for sent in found {
                send_control(self.transport.as_ref(), &WireMessage::Ordered(sent.message)).await;
                self.stats.retransmitted += 1;
            }
            return Ok(());
        }

        let priority = found.iter().map(|sent| sent.priority).max().unwrap_or(RESUBMIT_PRIORITY);
        let count = found.len() as u64;
        let deltas: Vec<GraphDelta> = found.into_iter().flat_map(|sent| sent.deltas).collect();
        if deltas.is_empty() {
            return Ok(());
        }
        tracing::info!(messages = count, deltas = deltas.len(), "Re-emitting deltas for resync");
        self.enqueue_payload(plain_payload(deltas.clone()), deltas, priority).await?;
        self.stats.retransmitted += count;
        Ok(())
    }

    async fn receive_ordered(&mut self, message: OrderedMessage, now: Instant) -> Result<(), EngineError> {
        if message.source_id == self.source_id {
            return Ok(());
        }
        if !message.verify_hash() {
            self.stats.rejected += 1;
            tracing::warn!(
                message_id = %message.id,
                source_id = %message.source_id,
                "Dropping message with mismatched hash"
            );
            return Ok(());
        }

        let receipt = self.dedup.receive(message, now);
        for delivered in receipt.delivered {
            self.process_delivered(delivered, now).await?;
        }
        Ok(())
    }

    async fn process_delivered(&mut self, message: OrderedMessage, now: Instant) -> Result<(), EngineError> {
        let deltas = match message.payload() {
            Ok(Payload::Delta(delta)) => vec![delta],
            Ok(Payload::Batch(deltas)) => deltas,
            Ok(Payload::Compressed(compressed)) => {
                match self.compressor.decompress_batch(&message.source_id, &compressed) {
                    Ok(deltas) => deltas,
                    Err(e) => {
                        self.stats.rejected += 1;
                        tracing::warn!(source_id = %message.source_id, error = %e, "Dropping compressed payload");
                        self.compressor.reset_received(&message.source_id);
                        if e.needs_resync() {
                            let missing = vec![SequenceRange::single(message.sequence_number)];
                            self.request_resync(&message.source_id, missing, resync_reason(&e))
                                .await;
                        }
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                self.stats.rejected += 1;
                tracing::warn!(message_id = %message.id, error = %e, "Dropping undecodable payload");
                return Ok(());
            }
        };

        self.reconcile(deltas, now).await
    }

    /// Settle remote deltas against pending local deltas and recently
    /// applied ones, then apply.
    async fn reconcile(&mut self, remote: Vec<GraphDelta>, now: Instant) -> Result<(), EngineError> {
        let mut local = self.batcher.pending_deltas();
        let pending_ids: HashSet<String> = local.iter().map(|d| d.id.clone()).collect();
        local.extend(
            self.resolver
                .recent()
                .filter(|d| !pending_ids.contains(&d.id))
                .cloned(),
        );
        let conflicts = if local.is_empty() {
            Vec::new()
        } else {
            self.resolver.detect_conflicts(&local, &remote)
        };

        if conflicts.is_empty() {
            for delta in remote {
                self.apply_remote(delta);
            }
            return Ok(());
        }

        let involved: HashSet<String> = conflicts.iter().map(|c| c.remote.id.clone()).collect();
        let resolution = self.resolver.resolve(conflicts);
        for delta in remote.into_iter().filter(|d| !involved.contains(&d.id)) {
            self.apply_remote(delta);
        }

        self.settle(resolution, &pending_ids, now).await
    }

    /// Apply a resolution. `local_ids` are the deltas still waiting in the
    /// batcher; every other losing delta is recorded without being applied.
    async fn settle(&mut self, resolution: Resolution, local_ids: &HashSet<String>, now: Instant) -> Result<(), EngineError> {
        for delta in &resolution.rejected {
            if local_ids.contains(&delta.id) {
                if self.batcher.withdraw(&delta.id) {
                    tracing::debug!(delta_id = %delta.id, "Withdrew losing local delta");
                }
            } else if !self.resolver.is_applied(&delta.id) {
                let drained = self.resolver.discard(delta);
                self.stats.remote_applied += drained.len() as u64;
                self.deliver(&drained);
            }
        }

        for delta in resolution.accepted {
            if local_ids.contains(&delta.id) {
                self.batcher.replace(delta);
            } else {
                self.apply_remote(delta);
            }
        }

        let mut resubmit = false;
        for merged in resolution.merged {
            let covers_local = merged.covered_ids().any(|id| local_ids.contains(id));
            for id in merged.covered_ids().filter(|id| local_ids.contains(*id)) {
                self.batcher.withdraw(id);
            }
            self.apply_remote(merged.clone());
            if covers_local && self.batcher.add_update(merged, RESUBMIT_PRIORITY, now) == AddOutcome::Ready {
                resubmit = true;
            }
        }

        for conflict in &resolution.unresolved {
            tracing::info!(conflict_id = %conflict.id, "Remote delta held for manual resolution");
        }

        if resubmit {
            self.flush_batch(now).await?;
        }
        Ok(())
    }

    /// Settle a deferred conflict by naming the winning delta.
    ///
    /// # Errors
    ///
    /// Returns error if the conflict or winner is unknown.
    pub async fn resolve_deferred(&mut self, conflict_id: &str, winner_id: &str, now: Instant) -> Result<(), EngineError> {
        let resolution = self.resolver.resolve_deferred(conflict_id, winner_id)?;
        let local_ids: HashSet<String> = self.batcher.pending_deltas().into_iter().map(|d| d.id).collect();
        self.settle(resolution, &local_ids, now).await
    }

    fn apply_remote(&mut self, delta: GraphDelta) {
        let outcome = self.resolver.apply_delta(delta);
        self.stats.remote_applied += outcome.applied.len() as u64;
        self.deliver(&outcome.applied);
    }

    fn deliver(&mut self, applied: &[GraphDelta]) {
        for delta in applied {
            self.sink.apply(delta);
        }
    }

    async fn request_resync(&mut self, source_id: &str, missing: Vec<SequenceRange>, reason: ResyncReason) {
        self.stats.resyncs_requested += 1;
        let request = WireMessage::Resync(ResyncRequest {
            requester_id: self.source_id.clone(),
            source_id: source_id.to_string(),
            missing,
            reason,
        });
        send_control(self.transport.as_ref(), &request).await;
    }

    /// Fire due timers: acknowledgements, gap handling and the batch timer.
    ///
    /// # Errors
    ///
    /// Returns error if a due batch cannot be built or queued.
    pub async fn poll_timers(&mut self, now: Instant) -> Result<(), EngineError> {
        for event in self.dedup.poll_timers(now) {
            match event {
                DedupEvent::Acknowledge { source_id, ids } => {
                    let ack = WireMessage::Ack(AckBatch {
                        acker_id: self.source_id.clone(),
                        source_id,
                        ids,
                    });
                    send_control(self.transport.as_ref(), &ack).await;
                }
                DedupEvent::GapSkipped {
                    source_id,
                    missing,
                    delivered,
                } => {
                    for message in delivered {
                        self.process_delivered(message, now).await?;
                    }
                    if self.request_retransmit_on_skip && !missing.is_empty() {
                        self.request_resync(&source_id, missing, ResyncReason::Skipped).await;
                    }
                }
                DedupEvent::Resync { source_id, missing } => {
                    self.request_resync(&source_id, missing, ResyncReason::Gap).await;
                }
            }
        }

        if self.batcher.poll_timer(now) {
            self.flush_batch(now).await?;
        }
        Ok(())
    }

    /// Earliest pending timer across components.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.dedup.next_deadline(), self.batcher.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drive the engine until `shutdown` completes, then flush pending
    /// local deltas into the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the final flush fails.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<WireMessage>,
        mut local: mpsc::Receiver<LocalUpdate>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), EngineError> {
        tokio::pin!(shutdown);
        tracing::info!(source_id = %self.source_id, "Sync engine started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                () = &mut shutdown => break,
                Some(message) = inbound.recv() => {
                    if let Err(e) = self.handle_inbound(message, Instant::now()).await {
                        tracing::warn!(error = %e, "Inbound handling failed");
                    }
                }
                Some(update) = local.recv() => {
                    if let Err(e) = self.submit_local(update.delta, update.priority, Instant::now()).await {
                        tracing::warn!(error = %e, "Local submit failed");
                    }
                }
                () = sleep_until(deadline) => {
                    if let Err(e) = self.poll_timers(Instant::now()).await {
                        tracing::warn!(error = %e, "Timer handling failed");
                    }
                }
            }
        }

        while self.batcher.pending_len() > 0 {
            let before = self.batcher.pending_len();
            self.flush_batch(Instant::now()).await?;
            if self.batcher.pending_len() == before {
                break;
            }
        }
        tracing::info!(source_id = %self.source_id, stats = ?self.stats, "Sync engine stopped");
        Ok(())
    }
}

/// Control messages and gap retransmissions bypass the queue.
async fn send_control(transport: &dyn Transport, message: &WireMessage) {
    if let Err(e) = transport.send(message).await {
        tracing::warn!(kind = message.kind(), error = %e, "Failed to send control message");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn plain_payload(mut deltas: Vec<GraphDelta>) -> Payload {
    if deltas.len() == 1 {
        Payload::Delta(deltas.remove(0))
    } else {
        Payload::Batch(deltas)
    }
}

fn resync_reason(error: &CompressionError) -> ResyncReason {
    match error {
        CompressionError::ChecksumMismatch { .. } => ResyncReason::ChecksumMismatch,
        CompressionError::BaselineMismatch => ResyncReason::BaselineMismatch,
        CompressionError::Decode(_) | CompressionError::Encode(_) => ResyncReason::Decode,
    }
}
