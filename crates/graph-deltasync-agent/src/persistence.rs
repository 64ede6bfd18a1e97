//! `SQLite` persistence for the offline queue and outbound sequence numbers.

use async_trait::async_trait;
use graph_deltasync_engine::{QueueStore, StoreError};
use graph_deltasync_proto::{QueueMetadata, QueuedMessage};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const COLUMNS: &str = "id, type, data, timestamp, retry_count, priority, metadata";

/// `SQLite`-backed queue store.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    #[allow(dead_code)]
    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            r"
            -- Outbound messages awaiting delivery
            CREATE TABLE IF NOT EXISTS queued_messages (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queued_next_attempt ON queued_messages(next_attempt_at);
            CREATE INDEX IF NOT EXISTS idx_queued_delivery ON queued_messages(priority DESC, timestamp ASC);

            -- Last sequence number emitted per local source
            CREATE TABLE IF NOT EXISTS outbound_sequences (
                source_id TEXT PRIMARY KEY,
                last_sequence INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// JSON text of the data and metadata columns.
fn encode_columns(message: &QueuedMessage) -> Result<(String, Option<String>), StoreError> {
    let data = serde_json::to_string(&message.data).map_err(encoding)?;
    let metadata = message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(encoding)?;
    Ok((data, metadata))
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn add(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        let (data, metadata) = encode_columns(message)?;

        self.conn()
            .execute(
                r"
                INSERT OR REPLACE INTO queued_messages
                    (id, type, data, timestamp, retry_count, priority, next_attempt_at, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                (
                    &message.id,
                    &message.message_type,
                    data,
                    message.timestamp,
                    message.retry_count,
                    message.priority,
                    message.next_attempt_at(),
                    metadata,
                ),
            )
            .map_err(backend)?;
        Ok(())
    }

    async fn update(&self, message: &QueuedMessage) -> Result<bool, StoreError> {
        let (data, metadata) = encode_columns(message)?;

        let updated = self
            .conn()
            .execute(
                r"
                UPDATE queued_messages
                SET type = ?2, data = ?3, timestamp = ?4, retry_count = ?5,
                    priority = ?6, next_attempt_at = ?7, metadata = ?8
                WHERE id = ?1
                ",
                (
                    &message.id,
                    &message.message_type,
                    data,
                    message.timestamp,
                    message.retry_count,
                    message.priority,
                    message.next_attempt_at(),
                    metadata,
                ),
            )
            .map_err(backend)?;
        Ok(updated > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM queued_messages WHERE id = ?1"))
            .map_err(backend)?;
        stmt.query_row([id], row_to_message).optional().map_err(backend)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM queued_messages WHERE id = ?1", [id])
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM queued_messages", [], |row| row.get(0))
            .map_err(backend)?;
        usize::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn ready(&self, now_ms: i64, limit: usize) -> Result<Vec<QueuedMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                r"
                SELECT {COLUMNS} FROM queued_messages
                WHERE next_attempt_at <= ?1
                ORDER BY priority DESC, timestamp ASC, id ASC
                LIMIT ?2
                "
            ))
            .map_err(backend)?;

        let messages = stmt
            .query_map((now_ms, limit), row_to_message)
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;
        Ok(messages)
    }

    async fn last_sequence(&self, source_id: &str) -> Result<Option<u64>, StoreError> {
        let last: Option<i64> = self
            .conn()
            .query_row(
                "SELECT last_sequence FROM outbound_sequences WHERE source_id = ?1",
                [source_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        last.map(u64::try_from)
            .transpose()
            .map_err(|e| StoreError::Encoding(e.to_string()))
    }

    async fn save_sequence(&self, source_id: &str, sequence: u64) -> Result<(), StoreError> {
        let sequence = i64::try_from(sequence).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO outbound_sequences (source_id, last_sequence) VALUES (?1, ?2)",
                (source_id, sequence),
            )
            .map_err(backend)?;
        Ok(())
    }
}

fn row_to_message(row: &Row<'_>) -> SqliteResult<QueuedMessage> {
    let data: String = row.get(2)?;
    let metadata: Option<String> = row.get(6)?;

    Ok(QueuedMessage {
        id: row.get(0)?,
        message_type: row.get(1)?,
        data: serde_json::from_str(&data).map_err(|e| conversion(2, e))?,
        timestamp: row.get(3)?,
        retry_count: row.get(4)?,
        priority: row.get(5)?,
        metadata: metadata
            .map(|m| serde_json::from_str::<QueueMetadata>(&m))
            .transpose()
            .map_err(|e| conversion(6, e))?,
    })
}

fn conversion(column: usize, error: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(error))
}

#[allow(clippy::needless_pass_by_value)]
fn backend(error: rusqlite::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn encoding(error: serde_json::Error) -> StoreError {
    StoreError::Encoding(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, priority: u8, ts: i64) -> QueuedMessage {
        QueuedMessage::new(id, "ordered", json!({ "id": id, "nested": [1, 2] }), priority, ts)
    }

    #[tokio::test]
    async fn sqlite_store_basic_operations() {
        let store = SqliteQueueStore::in_memory().unwrap();

        store.add(&message("a", 1, 10)).await.unwrap();
        store.add(&message("b", 5, 20)).await.unwrap();
        store.add(&message("c", 5, 15)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        let ready: Vec<String> = store.ready(100, 10).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ready, vec!["c", "b", "a"]);
        assert_eq!(store.ready(100, 1).await.unwrap().len(), 1);

        assert!(store.remove("b").await.unwrap());
        assert!(!store.remove("b").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(message("a", 1, 10)));
        assert_eq!(store.get("zz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_keeps_retry_state() {
        let store = SqliteQueueStore::in_memory().unwrap();
        let mut m = message("a", 1, 10);
        store.add(&m).await.unwrap();

        m.record_failure("timeout", 500);
        store.add(&m).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.ready(100, 10).await.unwrap().is_empty());
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.metadata.unwrap().last_error.as_deref(), Some("timeout"));
        assert_eq!(store.ready(500, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_only_touches_existing_rows() {
        let store = SqliteQueueStore::in_memory().unwrap();
        let mut m = message("a", 1, 10);
        assert!(!store.update(&m).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);

        store.add(&m).await.unwrap();
        m.mark_sent(10, 10_010);
        assert!(store.update(&m).await.unwrap());
        let stored = store.get("a").await.unwrap().unwrap();
        assert!(stored.in_flight());
        assert!(store.ready(5_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = SqliteQueueStore::open(&path).unwrap();
            store.add(&message("durable", 3, 1)).await.unwrap();
            store.save_sequence("agent-1", 41).await.unwrap();
            store.save_sequence("agent-1", 42).await.unwrap();
        }

        let store = SqliteQueueStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get("durable").await.unwrap(), Some(message("durable", 3, 1)));
        assert_eq!(store.last_sequence("agent-1").await.unwrap(), Some(42));
        assert_eq!(store.last_sequence("agent-2").await.unwrap(), None);
    }
}
