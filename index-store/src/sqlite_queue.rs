use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::{now_ms, QueueError, QueueTransport, Receipt, ReceivedMessage, RedrivePolicy};

/// SQLite-backed message queue with visibility timeout and redrive-to-DLQ.
///
/// Many logical queues share one table; a message belongs to the queue named in its row.
/// Receiving a message hides it for the visibility timeout. Once a message has been received
/// `max_receive_count` times, the next receive moves it to the policy's DLQ instead.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    /// Open an in-memory queue store.
    pub fn new(visibility_timeout: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let q = Self { conn: Mutex::new(conn), visibility_timeout };
        q.init()?;
        Ok(q)
    }

    /// Open a file-backed queue store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let q = Self { conn: Mutex::new(conn), visibility_timeout };
        q.init()?;
        Ok(q)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Backend("queue connection poisoned".into()))
    }

    fn init(&self) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                visible_at_ms INTEGER NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages(queue, visible_at_ms);

            CREATE TABLE IF NOT EXISTS redrive_policies (
                queue TEXT PRIMARY KEY,
                dlq TEXT NOT NULL,
                max_receive_count INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn visibility_ms(&self) -> i64 { i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX) }
}

impl QueueTransport for SqliteQueue {
    fn set_redrive_policy(&self, queue: &str, policy: &RedrivePolicy) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO redrive_policies (queue, dlq, max_receive_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(queue) DO UPDATE SET dlq=excluded.dlq, max_receive_count=excluded.max_receive_count",
            params![queue, policy.dlq, policy.max_receive_count.max(1) as i64],
        )?;
        Ok(())
    }

    fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue_messages (queue, body, receive_count, visible_at_ms, sent_at) VALUES (?1, ?2, 0, ?3, ?4)",
            params![queue, body, now_ms(), chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn receive(&self, queue: &str) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let policy: Option<(String, i64)> = tx
            .query_row(
                "SELECT dlq, max_receive_count FROM redrive_policies WHERE queue = ?1",
                [queue],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let now = now_ms();
        loop {
            let next: Option<(i64, String, i64)> = tx
                .query_row(
                    "SELECT id, body, receive_count FROM queue_messages WHERE queue = ?1 AND visible_at_ms <= ?2 ORDER BY id LIMIT 1",
                    params![queue, now],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((id, body, receive_count)) = next else {
                tx.commit()?;
                return Ok(None);
            };
            if let Some((dlq, max_receive_count)) = &policy {
                if receive_count >= *max_receive_count {
                    tx.execute(
                        "UPDATE queue_messages SET queue = ?1, receive_count = 0, visible_at_ms = ?2 WHERE id = ?3",
                        params![dlq, now, id],
                    )?;
                    debug!(queue, dlq = %dlq, message_id = id, receive_count, "moved message to dead letter queue");
                    continue;
                }
            }
            let count = receive_count + 1;
            tx.execute(
                "UPDATE queue_messages SET receive_count = ?1, visible_at_ms = ?2 WHERE id = ?3",
                params![count, now.saturating_add(self.visibility_ms()), id],
            )?;
            tx.commit()?;
            let receipt = Receipt { id, receive_count: u32::try_from(count).unwrap_or(u32::MAX) };
            return Ok(Some(ReceivedMessage { receipt, body }));
        }
    }

    fn delete(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM queue_messages WHERE id = ?1 AND receive_count = ?2",
            params![receipt.id, receipt.receive_count as i64],
        )?;
        Ok(n > 0)
    }

    fn visible_count(&self, queue: &str) -> Result<u64, QueueError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM queue_messages WHERE queue = ?1 AND visible_at_ms <= ?2",
            params![queue, now_ms()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn in_flight_count(&self, queue: &str) -> Result<u64, QueueError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT count(*) FROM queue_messages WHERE queue = ?1 AND visible_at_ms > ?2",
            params![queue, now_ms()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM queue_messages WHERE queue = ?1", [queue])?;
        Ok(n as u64)
    }
}
