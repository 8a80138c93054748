//! Task queue abstraction: at-least-once FIFO with two backends.
//!
//! The in-process backend is exact within one process; the broker backend
//! persists messages in a SQLite file and survives restarts. Either way the
//! forge label state stays the real source of truth, so duplicate deliveries
//! are harmless.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{AgentError, Result};
use crate::task::TaskDescriptor;

/// Granularity of the signal-checked poll loops.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue contract shared by both backends.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Synchronous enqueue; persistent on the broker backend.
    async fn put(&self, descriptor: &TaskDescriptor) -> Result<()>;

    /// Non-blocking receive.
    async fn try_get(&self) -> Result<Option<TaskDescriptor>>;

    /// Blocking receive with a deadline. `None` timeout waits indefinitely.
    async fn get(&self, timeout: Option<Duration>) -> Result<Option<TaskDescriptor>>;

    /// Advisory emptiness check, used by the producer to decide whether a
    /// fresh poll is needed.
    async fn empty(&self) -> Result<bool>;

    /// Poll the queue at `poll_interval`, aborting early when
    /// `signal_checker` reports a pause or shutdown request. This is how
    /// workers react to signals without waiting out the full timeout.
    async fn get_with_signal_check(
        &self,
        timeout: Option<Duration>,
        poll_interval: Duration,
        signal_checker: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Option<TaskDescriptor>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if signal_checker() {
                return Ok(None);
            }
            if let Some(descriptor) = self.try_get().await? {
                return Ok(Some(descriptor));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// In-process bounded FIFO. Exactly-once within the owning process.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    queue: Mutex<VecDeque<TaskDescriptor>>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn put(&self, descriptor: &TaskDescriptor) -> Result<()> {
        self.queue.lock().push_back(descriptor.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn try_get(&self) -> Result<Option<TaskDescriptor>> {
        Ok(self.queue.lock().pop_front())
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Option<TaskDescriptor>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(descriptor) = self.queue.lock().pop_front() {
                return Ok(Some(descriptor));
            }
            let notified = self.notify.notified();
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        // One last pop covers a put that raced the timeout.
                        return Ok(self.queue.lock().pop_front());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn empty(&self) -> Result<bool> {
        Ok(self.queue.lock().is_empty())
    }
}

/// Durable broker backend over a SQLite file. Messages are persistent and
/// delivered at-least-once across restarts, FIFO by insertion order.
pub struct BrokerTaskQueue {
    conn: Mutex<Connection>,
}

impl BrokerTaskQueue {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS broker (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 body TEXT NOT NULL,
                 enqueued_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn pop_front(&self) -> Result<Option<TaskDescriptor>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, body FROM broker ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            Some((id, body)) => {
                conn.execute("DELETE FROM broker WHERE id = ?1", [id])?;
                let descriptor: TaskDescriptor = serde_json::from_str(&body)
                    .map_err(|e| AgentError::Queue(format!("malformed broker message: {e}")))?;
                Ok(Some(descriptor))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskQueue for BrokerTaskQueue {
    async fn put(&self, descriptor: &TaskDescriptor) -> Result<()> {
        let body = serde_json::to_string(descriptor)?;
        self.conn.lock().execute(
            "INSERT INTO broker (body, enqueued_at) VALUES (?1, ?2)",
            rusqlite::params![body, descriptor.enqueued_at.to_rfc3339()],
        )?;
        Ok(())
    }

    async fn try_get(&self) -> Result<Option<TaskDescriptor>> {
        self.pop_front()
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Option<TaskDescriptor>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(descriptor) = self.pop_front()? {
                return Ok(Some(descriptor));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }

    async fn empty(&self) -> Result<bool> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM broker", [], |row| row.get(0))?;
        Ok(count == 0)
    }
}
