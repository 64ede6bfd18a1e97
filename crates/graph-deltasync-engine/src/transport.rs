//! Transport interface and an in-memory implementation.

use async_trait::async_trait;
use graph_deltasync_proto::WireMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handler invoked for each inbound message.
pub type MessageHandler = Arc<dyn Fn(WireMessage) + Send + Sync>;

/// Server verdict on a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Everything was accepted
    Accepted,
    /// The listed ids were rejected; the rest were accepted
    Partial {
        /// Rejected message ids
        failed_ids: Vec<String>,
    },
}

/// Errors from a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connection; nothing was sent
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The send was attempted and failed
    #[error("send failed: {0}")]
    Failed(String),
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an unsubscribe action.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Message transport used by the engine and the offline queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    async fn send(&self, message: &WireMessage) -> Result<Delivery, TransportError>;

    /// Register an inbound handler.
    fn subscribe(&self, handler: MessageHandler) -> Subscription;

    /// Whether the transport currently has a connection.
    fn is_connected(&self) -> bool {
        true
    }
}

type Subscribers = Arc<Mutex<HashMap<u64, MessageHandler>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loopback transport: every sent message is recorded and handed to every
/// subscriber. Responses can be scripted for failure tests.
#[derive(Default)]
pub struct MemoryTransport {
    connected: AtomicBool,
    next_id: AtomicU64,
    subscribers: Subscribers,
    sent: Mutex<Vec<WireMessage>>,
    script: Mutex<VecDeque<Result<Delivery, TransportError>>>,
}

impl MemoryTransport {
    /// Create a connected transport.
    #[must_use]
    pub fn new() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// Simulate connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue the outcome of a future `send`. Unscripted sends succeed.
    pub fn push_response(&self, response: Result<Delivery, TransportError>) {
        lock(&self.script).push_back(response);
    }

    /// Messages sent and accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<WireMessage> {
        lock(&self.sent).clone()
    }

    /// Deliver a message to subscribers as if it came from the network.
    pub fn inject(&self, message: &WireMessage) {
        let handlers: Vec<MessageHandler> = lock(&self.subscribers).values().cloned().collect();
        for handler in handlers {
            handler(message.clone());
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &WireMessage) -> Result<Delivery, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable("memory transport disconnected".to_string()));
        }
        let response = lock(&self.script).pop_front().unwrap_or(Ok(Delivery::Accepted));
        if response.is_ok() {
            lock(&self.sent).push(message.clone());
            self.inject(message);
        }
        response
    }

    fn subscribe(&self, handler: MessageHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).insert(id, handler);
        let subscribers = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            lock(&subscribers).remove(&id);
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_deltasync_proto::{AckBatch, WireMessage};

    fn ack() -> WireMessage {
        WireMessage::Ack(AckBatch {
            acker_id: "a".to_string(),
            source_id: "b".to_string(),
            ids: vec!["1".to_string()],
        })
    }

    #[tokio::test]
    async fn loopback_and_unsubscribe() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = transport.subscribe(Arc::new(move |msg| sink.lock().unwrap().push(msg)));

        assert_eq!(transport.send(&ack()).await, Ok(Delivery::Accepted));
        assert_eq!(seen.lock().unwrap().len(), 1);

        subscription.unsubscribe();
        assert_eq!(transport.subscriber_count(), 0);
        transport.send(&ack()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn scripted_and_disconnected_sends() {
        let transport = MemoryTransport::new();
        transport.push_response(Err(TransportError::Failed("500".to_string())));

        assert!(matches!(transport.send(&ack()).await, Err(TransportError::Failed(_))));
        assert!(transport.sent().is_empty());

        transport.set_connected(false);
        assert!(matches!(transport.send(&ack()).await, Err(TransportError::Unavailable(_))));
        transport.set_connected(true);
        assert_eq!(transport.send(&ack()).await, Ok(Delivery::Accepted));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let transport = MemoryTransport::new();
        {
            let _subscription = transport.subscribe(Arc::new(|_| {}));
            assert_eq!(transport.subscriber_count(), 1);
        }
        assert_eq!(transport.subscriber_count(), 0);
    }
}
