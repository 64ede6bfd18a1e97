//! Durable queue storage interface.

use async_trait::async_trait;
use graph_deltasync_proto::QueuedMessage;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Storage for queued outbound messages.
///
/// `add` is an upsert keyed by message id; `update` only rewrites a record
/// that still exists. `ready` returns records whose next attempt is due,
/// highest priority first, then oldest first. The store also keeps the last
/// outbound sequence number per source so numbering survives restarts.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or replace a record.
    async fn add(&self, message: &QueuedMessage) -> Result<(), StoreError>;

    /// Replace an existing record. Returns false if it is gone.
    async fn update(&self, message: &QueuedMessage) -> Result<bool, StoreError>;

    /// Fetch a record by id.
    async fn get(&self, id: &str) -> Result<Option<QueuedMessage>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Up to `limit` records due at `now_ms`.
    async fn ready(&self, now_ms: i64, limit: usize) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Last outbound sequence number saved for `source_id`.
    async fn last_sequence(&self, source_id: &str) -> Result<Option<u64>, StoreError>;

    /// Save the last outbound sequence number of `source_id`.
    async fn save_sequence(&self, source_id: &str, sequence: u64) -> Result<(), StoreError>;
}

/// Errors from a queue store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend failed
    #[error("store backend error: {0}")]
    Backend(String),
    /// A record could not be encoded or decoded
    #[error("store encoding error: {0}")]
    Encoding(String),
}

/// Order records by priority descending, then timestamp ascending.
pub fn sort_for_delivery(messages: &mut [QueuedMessage]) {
    messages.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// In-memory queue store.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    records: Mutex<HashMap<String, QueuedMessage>>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, QueuedMessage>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sequences(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.sequences.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn add(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        self.records().insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn update(&self, message: &QueuedMessage) -> Result<bool, StoreError> {
        match self.records().get_mut(&message.id) {
            Some(slot) => {
                *slot = message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        Ok(self.records().get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records().remove(id).is_some())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records().len())
    }

    async fn ready(&self, now_ms: i64, limit: usize) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut due: Vec<QueuedMessage> = self
            .records()
            .values()
            .filter(|m| m.is_ready(now_ms))
            .cloned()
            .collect();
        sort_for_delivery(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn last_sequence(&self, source_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.sequences().get(source_id).copied())
    }

    async fn save_sequence(&self, source_id: &str, sequence: u64) -> Result<(), StoreError> {
        self.sequences().insert(source_id.to_string(), sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ready_orders_by_priority_then_age() {
        let store = MemoryQueueStore::new();
        store.add(&QueuedMessage::new("old-low", "t", json!({}), 1, 10)).await.unwrap();
        store.add(&QueuedMessage::new("new-high", "t", json!({}), 5, 30)).await.unwrap();
        store.add(&QueuedMessage::new("old-high", "t", json!({}), 5, 20)).await.unwrap();

        let mut delayed = QueuedMessage::new("delayed", "t", json!({}), 9, 0);
        delayed.record_failure("boom", 1_000);
        store.add(&delayed).await.unwrap();

        let ids: Vec<String> = store.ready(100, 10).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["old-high", "new-high", "old-low"]);
        assert_eq!(store.ready(100, 1).await.unwrap().len(), 1);
        assert_eq!(store.ready(1_000, 10).await.unwrap()[0].id, "delayed");
    }

    #[tokio::test]
    async fn add_is_upsert() {
        let store = MemoryQueueStore::new();
        let mut msg = QueuedMessage::new("m", "t", json!({}), 1, 0);
        store.add(&msg).await.unwrap();
        msg.retry_count = 2;
        store.add(&msg).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("m").await.unwrap().unwrap().retry_count, 2);
        assert!(store.remove("m").await.unwrap());
        assert!(!store.remove("m").await.unwrap());
    }

    #[tokio::test]
    async fn update_skips_removed_records() {
        let store = MemoryQueueStore::new();
        let mut msg = QueuedMessage::new("m", "t", json!({}), 1, 0);
        assert!(!store.update(&msg).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);

        store.add(&msg).await.unwrap();
        msg.retry_count = 1;
        assert!(store.update(&msg).await.unwrap());
        assert_eq!(store.get("m").await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn sequences_are_kept_per_source() {
        let store = MemoryQueueStore::new();
        assert_eq!(store.last_sequence("a").await.unwrap(), None);
        store.save_sequence("a", 3).await.unwrap();
        store.save_sequence("b", 9).await.unwrap();
        store.save_sequence("a", 4).await.unwrap();
        assert_eq!(store.last_sequence("a").await.unwrap(), Some(4));
        assert_eq!(store.last_sequence("b").await.unwrap(), Some(9));
    }
}
