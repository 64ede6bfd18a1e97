//! Durable offline queue with bounded retry.
//!
//! Messages are written to a [`QueueStore`] before `enqueue` returns, so the
//! queue survives restarts. While online a periodic task drains the store
//! through the [`Transport`]; failed sends back off exponentially and are
//! dead-lettered once they exceed the retry budget. Records that ask for an
//! acknowledgement stay in the store after an accepted send until the
//! receiver acknowledges them, and are sent again once the acknowledgement
//! timeout passes.

use crate::store::{QueueStore, StoreError};
use crate::transport::{Delivery, Transport, TransportError};
use graph_deltasync_core::now_ms;
use graph_deltasync_proto::{MessageGroup, QueuedMessage, WireMessage};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Callback invoked once for every dead-lettered message.
pub type DeadLetterHandler = Arc<dyn Fn(&QueuedMessage) + Send + Sync>;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retries allowed before a message is dead-lettered
    pub max_retries: u32,
    /// Messages pulled per sync
    pub batch_size: usize,
    /// Period of the background sync while online
    pub sync_interval: Duration,
    /// Backoff after the first failure
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Wait for an acknowledgement before an accepted record is sent again
    pub ack_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_size: 50,
            sync_interval: Duration::from_secs(30),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Connectivity and activity of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No sync attempts are made
    Offline,
    /// Online, waiting for work
    Idle,
    /// A sync is running
    Syncing,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another sync was running, or the queue is offline
    pub skipped: bool,
    /// Messages accepted by the transport
    pub sent: usize,
    /// Accepted messages kept until the receiver acknowledges them
    pub awaiting_ack: usize,
    /// Messages scheduled for another attempt
    pub retried: usize,
    /// Messages removed after exhausting retries
    pub dead_lettered: usize,
    /// The transport had no connection; the run stopped early
    pub unavailable: bool,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Errors from the offline queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Clears the sync flag when a run ends, including on early return.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Offline-capable outbound queue.
pub struct OfflineQueueManager {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    online: AtomicBool,
    syncing: AtomicBool,
    dead_letter: Mutex<Option<DeadLetterHandler>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineQueueManager {
    /// Create an offline queue.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>, transport: Arc<dyn Transport>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            transport,
            online: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            dead_letter: Mutex::new(None),
            periodic: Mutex::new(None),
        })
    }

    /// Register the dead-letter callback.
    pub fn on_dead_letter(&self, handler: impl Fn(&QueuedMessage) + Send + Sync + 'static) {
        *lock(&self.dead_letter) = Some(Arc::new(handler));
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        if !self.online.load(Ordering::SeqCst) {
            QueueState::Offline
        } else if self.syncing.load(Ordering::SeqCst) {
            QueueState::Syncing
        } else {
            QueueState::Idle
        }
    }

    /// Whether the queue is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Persist a message; sync right away when online and idle.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the message.
    pub async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError> {
        self.store.add(&message).await?;
        tracing::debug!(message_id = %message.id, priority = message.priority, "Enqueued message");

        if self.is_online() && !self.syncing.load(Ordering::SeqCst) {
            self.sync().await?;
        }
        Ok(())
    }

    /// Remove messages acknowledged by the receiver, including records
    /// waiting for their acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn acknowledge(&self, ids: &[String]) -> Result<usize, QueueError> {
        let mut removed = 0;
        for id in ids {
            if self.store.remove(id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Removed acknowledged messages");
        }
        Ok(removed)
    }

    /// Number of queued messages.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.count().await?)
    }

    /// Last outbound sequence number saved for a source.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn last_sequence(&self, source_id: &str) -> Result<Option<u64>, QueueError> {
        Ok(self.store.last_sequence(source_id).await?)
    }

    /// Save the last outbound sequence number of a source.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn save_sequence(&self, source_id: &str, sequence: u64) -> Result<(), QueueError> {
        Ok(self.store.save_sequence(source_id, sequence).await?)
    }

    /// Send one batch of due messages.
    ///
    /// Overlapping calls return a skipped report without touching the store.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn sync(&self) -> Result<SyncReport, QueueError> {
        if !self.is_online() {
            return Ok(SyncReport::skipped());
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync already running, skipping");
            return Ok(SyncReport::skipped());
        }
        let _guard = SyncGuard(&self.syncing);

        let now = now_ms();
        let mut report = SyncReport::default();
        let mut batch = Vec::new();
        for message in self.store.ready(now, self.config.batch_size).await? {
            if message.in_flight() {
                tracing::debug!(message_id = %message.id, "Acknowledgement overdue");
                self.retry(message, "acknowledgement timed out", now, &mut report).await?;
            } else {
                batch.push(message);
            }
        }

        for group in group_by_type(batch) {
            let wire = WireMessage::Group(group.clone());
            match self.transport.send(&wire).await {
                Ok(Delivery::Accepted) => {
                    for message in group.messages {
                        self.settle_sent(message, now, &mut report).await?;
                    }
                }
                Ok(Delivery::Partial { failed_ids }) => {
                    let failed: HashSet<String> = failed_ids.into_iter().collect();
                    for message in group.messages {
                        if failed.contains(&message.id) {
                            self.retry(message, "rejected by receiver", now, &mut report).await?;
                        } else {
                            self.settle_sent(message, now, &mut report).await?;
                        }
                    }
                }
                Err(TransportError::Unavailable(reason)) => {
                    tracing::info!(reason = %reason, "Transport unavailable, deferring sync");
                    report.unavailable = true;
                    break;
                }
                Err(TransportError::Failed(reason)) => {
                    tracing::warn!(reason = %reason, count = group.messages.len(), "Group send failed");
                    for message in group.messages {
                        self.retry(message, &reason, now, &mut report).await?;
                    }
                }
            }
        }

        if report.sent + report.retried + report.dead_lettered > 0 {
            tracing::info!(
                sent = report.sent,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                "Sync finished"
            );
        }
        Ok(report)
    }

    /// Drop an accepted record, or keep it in flight until acknowledged.
    async fn settle_sent(&self, mut message: QueuedMessage, now: i64, report: &mut SyncReport) -> Result<(), QueueError> {
        report.sent += 1;
        if !message.ack_required() {
            self.store.remove(&message.id).await?;
            return Ok(());
        }

        let deadline = now.saturating_add(duration_ms(self.config.ack_timeout));
        message.mark_sent(now, deadline);
        // An acknowledgement may already have removed the record.
        if self.store.update(&message).await? {
            report.awaiting_ack += 1;
        }
        Ok(())
    }

    async fn retry(
        &self,
        mut message: QueuedMessage,
        reason: &str,
        now: i64,
        report: &mut SyncReport,
    ) -> Result<(), QueueError> {
        let next_attempt = now.saturating_add(self.backoff(message.retry_count + 1));
        message.record_failure(reason, next_attempt);

        if message.retry_count > self.config.max_retries {
            if self.store.remove(&message.id).await? {
                tracing::warn!(
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    "Message exceeded retry budget, dead-lettering"
                );
                let handler = lock(&self.dead_letter).clone();
                if let Some(handler) = handler {
                    handler(&message);
                }
                report.dead_lettered += 1;
            }
            return Ok(());
        }

        if !self.store.update(&message).await? {
            tracing::debug!(message_id = %message.id, "Record removed during send, not retrying");
            return Ok(());
        }
        tracing::debug!(message_id = %message.id, retry_count = message.retry_count, next_attempt, "Scheduling retry");
        report.retried += 1;
        Ok(())
    }

    /// Backoff in ms before attempt number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> i64 {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff);
        duration_ms(delay)
    }

    /// Switch connectivity.
    ///
    /// Going online starts the periodic sync, whose first tick syncs
    /// immediately. Going offline stops it; enqueues keep being accepted.
    pub fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online == was_online {
            return;
        }

        let mut periodic = lock(&self.periodic);
        if let Some(handle) = periodic.take() {
            handle.abort();
        }

        if online {
            tracing::info!(interval = ?self.config.sync_interval, "Queue online");
            let weak = Arc::downgrade(self);
            *periodic = Some(tokio::spawn(periodic_sync(weak, self.config.sync_interval)));
        } else {
            tracing::info!("Queue offline");
        }
    }
}

impl Drop for OfflineQueueManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.periodic).take() {
            handle.abort();
        }
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

async fn periodic_sync(queue: Weak<OfflineQueueManager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(queue) = queue.upgrade() else {
            break;
        };
        if let Err(e) = queue.sync().await {
            tracing::warn!(error = %e, "Periodic sync failed");
        }
    }
}

/// Group messages by type, keeping delivery order inside each group and
/// ordering groups by their first message.
fn group_by_type(messages: Vec<QueuedMessage>) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();
    for message in messages {
        match groups.iter_mut().find(|g| g.message_type == message.message_type) {
            Some(group) => group.messages.push(message),
            None => groups.push(MessageGroup {
                message_type: message.message_type.clone(),
                messages: vec![message],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryQueueStore;
    use crate::transport::{MemoryTransport, MessageHandler, Subscription};
    use async_trait::async_trait;
    use graph_deltasync_proto::messages::TYPE_DELTA;
    use graph_deltasync_proto::OrderedMessage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn message(id: &str, priority: u8, ts: i64) -> QueuedMessage {
        QueuedMessage::new(id, "ordered", json!({ "id": id }), priority, ts)
    }

    fn acked(sequence: u64, ts: i64) -> QueuedMessage {
        let ordered = OrderedMessage::new("src", sequence, TYPE_DELTA, json!({}), ts).with_ack();
        QueuedMessage::from_ordered(&ordered, 1).unwrap()
    }

    fn immediate() -> QueueConfig {
        QueueConfig {
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..QueueConfig::default()
        }
    }

    fn setup(config: QueueConfig) -> (Arc<OfflineQueueManager>, Arc<MemoryQueueStore>, Arc<MemoryTransport>) {
        let store = Arc::new(MemoryQueueStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let queue = OfflineQueueManager::new(store.clone(), transport.clone(), config);
        (queue, store, transport)
    }

    fn sent_ids(transport: &MemoryTransport) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .flat_map(|wire| match wire {
                WireMessage::Group(group) => group.ids(),
                _ => Vec::new(),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delivers_in_priority_order() {
        let (queue, store, transport) = setup(immediate());
        for (id, priority, ts) in [("a", 1, 1), ("b", 5, 2), ("c", 3, 3), ("d", 5, 4), ("e", 0, 5)] {
            queue.enqueue(message(id, priority, ts)).await.unwrap();
        }
        assert_eq!(queue.state(), QueueState::Offline);
        assert!(transport.sent().is_empty());
        assert_eq!(store.count().await.unwrap(), 5);

        queue.set_online(true);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(sent_ids(&transport), vec!["b", "d", "c", "a", "e"]);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn enqueue_while_online_syncs_immediately() {
        let (queue, _store, transport) = setup(immediate());
        queue.online.store(true, Ordering::SeqCst);

        queue.enqueue(message("x", 1, 1)).await.unwrap();
        assert_eq!(sent_ids(&transport), vec!["x"]);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_failure_retries_only_failed() {
        let (queue, store, transport) = setup(immediate());
        for id in ["a", "b", "c"] {
            queue.enqueue(message(id, 1, 1)).await.unwrap();
        }
        transport.push_response(Ok(Delivery::Partial {
            failed_ids: vec!["b".to_string()],
        }));
        queue.online.store(true, Ordering::SeqCst);

        let report = queue.sync().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        let b = store.get("b").await.unwrap().unwrap();
        assert_eq!(b.retry_count, 1);
        assert_eq!(b.metadata.unwrap().last_error.as_deref(), Some("rejected by receiver"));
    }

    #[tokio::test]
    async fn dead_letter_fires_exactly_once() {
        let config = QueueConfig {
            max_retries: 2,
            ..immediate()
        };
        let (queue, store, transport) = setup(config);
        let dead = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dead);
        queue.on_dead_letter(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.enqueue(message("doomed", 1, 1)).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            transport.push_response(Err(TransportError::Failed("500".to_string())));
        }

        let mut reports = Vec::new();
        for _ in 0..5 {
            reports.push(queue.sync().await.unwrap());
        }

        assert_eq!(reports.iter().map(|r| r.retried).sum::<usize>(), 2);
        assert_eq!(reports[2].dead_lettered, 1);
        assert_eq!(dead.load(Ordering::SeqCst), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_transport_defers_without_retrying() {
        let (queue, store, transport) = setup(immediate());
        queue.enqueue(message("m", 1, 1)).await.unwrap();
        transport.set_connected(false);
        queue.online.store(true, Ordering::SeqCst);

        let report = queue.sync().await.unwrap();
        assert!(report.unavailable);
        assert_eq!(report.retried, 0);
        assert_eq!(store.get("m").await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn backoff_delays_next_attempt() {
        let config = QueueConfig {
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
            ..QueueConfig::default()
        };
        let (queue, store, transport) = setup(config);
        queue.enqueue(message("m", 1, 1)).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);
        transport.push_response(Err(TransportError::Failed("timeout".to_string())));

        assert_eq!(queue.sync().await.unwrap().retried, 1);
        let second = queue.sync().await.unwrap();
        assert_eq!(second, SyncReport::default());
        assert_eq!(store.count().await.unwrap(), 1);

        assert_eq!(queue.backoff(1), 60_000);
        assert_eq!(queue.backoff(2), 120_000);
        assert_eq!(queue.backoff(10), 600_000);
    }

    #[tokio::test]
    async fn acknowledge_removes_messages() {
        let (queue, _store, _transport) = setup(immediate());
        queue.enqueue(message("a", 1, 1)).await.unwrap();
        queue.enqueue(message("b", 1, 1)).await.unwrap();

        let removed = queue.acknowledge(&["a".to_string(), "zz".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn accepted_records_wait_for_acknowledgement() {
        let config = QueueConfig {
            ack_timeout: Duration::from_secs(60),
            ..immediate()
        };
        let (queue, store, transport) = setup(config);
        queue.online.store(true, Ordering::SeqCst);
        let record = acked(1, 1);
        let id = record.id.clone();

        queue.enqueue(record).await.unwrap();
        assert_eq!(sent_ids(&transport), vec![id.clone()]);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(store.get(&id).await.unwrap().unwrap().in_flight());

        assert_eq!(queue.sync().await.unwrap(), SyncReport::default());
        assert_eq!(transport.sent().len(), 1);

        assert_eq!(queue.acknowledge(&[id]).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unacknowledged_records_are_sent_again() {
        let config = QueueConfig {
            ack_timeout: Duration::ZERO,
            ..immediate()
        };
        let (queue, store, transport) = setup(config);
        queue.online.store(true, Ordering::SeqCst);
        let record = acked(1, 1);
        let id = record.id.clone();
        queue.enqueue(record).await.unwrap();

        let overdue = queue.sync().await.unwrap();
        assert_eq!(overdue.retried, 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(!stored.in_flight());
        assert_eq!(
            stored.metadata.unwrap().last_error.as_deref(),
            Some("acknowledgement timed out")
        );

        let resent = queue.sync().await.unwrap();
        assert_eq!(resent.sent, 1);
        assert_eq!(resent.awaiting_ack, 1);
        assert_eq!(sent_ids(&transport), vec![id.clone(), id]);
    }

    #[tokio::test]
    async fn dead_letter_handler_may_replace_itself() {
        let config = QueueConfig {
            max_retries: 0,
            ..immediate()
        };
        let (queue, _store, transport) = setup(config);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let weak = Arc::downgrade(&queue);
        queue.on_dead_letter(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(queue) = weak.upgrade() {
                queue.on_dead_letter(|_| {});
            }
        });
        queue.online.store(true, Ordering::SeqCst);

        for id in ["first", "second"] {
            transport.push_response(Err(TransportError::Failed("500".to_string())));
            queue.enqueue(message(id, 1, 1)).await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    /// Drops every record it is asked to send, then reports failure.
    struct DroppingTransport {
        store: Arc<MemoryQueueStore>,
    }

    #[async_trait]
    impl Transport for DroppingTransport {
        async fn send(&self, message: &WireMessage) -> Result<Delivery, TransportError> {
            if let WireMessage::Group(group) = message {
                for id in group.ids() {
                    self.store.remove(&id).await.unwrap();
                }
            }
            Err(TransportError::Failed("connection reset".to_string()))
        }

        fn subscribe(&self, _handler: MessageHandler) -> Subscription {
            Subscription::new(|| {})
        }
    }

    #[tokio::test]
    async fn failed_send_does_not_restore_removed_records() {
        let store = Arc::new(MemoryQueueStore::new());
        let transport = Arc::new(DroppingTransport { store: store.clone() });
        let queue = OfflineQueueManager::new(store.clone(), transport, immediate());
        queue.enqueue(message("a", 1, 1)).await.unwrap();
        queue.enqueue(message("b", 1, 1)).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);

        let report = queue.sync().await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn groups_keep_order_by_type() {
        let mut other = message("x", 9, 0);
        other.message_type = "other".to_string();
        let groups = group_by_type(vec![message("a", 9, 0), other, message("b", 1, 0)]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].ids(), vec!["a", "b"]);
        assert_eq!(groups[1].ids(), vec!["x"]);
    }

    struct GatedTransport {
        gate: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, _message: &WireMessage) -> Result<Delivery, TransportError> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(Delivery::Accepted)
        }

        fn subscribe(&self, _handler: MessageHandler) -> Subscription {
            Subscription::new(|| {})
        }
    }

    #[tokio::test]
    async fn overlapping_sync_is_skipped() {
        let store = Arc::new(MemoryQueueStore::new());
        let transport = Arc::new(GatedTransport {
            gate: Notify::new(),
            entered: Notify::new(),
        });
        let queue = OfflineQueueManager::new(store.clone(), transport.clone(), immediate());
        queue.enqueue(message("m", 1, 1)).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);

        let running = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.sync().await })
        };
        transport.entered.notified().await;
        assert_eq!(queue.state(), QueueState::Syncing);

        let overlapping = queue.sync().await.unwrap();
        assert!(overlapping.skipped);

        transport.gate.notify_one();
        let first = running.await.unwrap().unwrap();
        assert_eq!(first.sent, 1);
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_stops_periodic_sync() {
        let config = QueueConfig {
            sync_interval: Duration::from_secs(10),
            ..immediate()
        };
        let (queue, _store, transport) = setup(config);
        queue.set_online(true);
        tokio::time::sleep(Duration::from_millis(1)).await;

        queue.set_online(false);
        queue.enqueue(message("late", 1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(transport.sent().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(queue.state(), QueueState::Offline);
    }
}
