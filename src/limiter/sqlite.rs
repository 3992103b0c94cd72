//! Token buckets kept in a SQLite file shared between processes.
//!
//! Each acquisition is one `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock before reading the bucket. Two processes can therefore
//! never both observe the pre-refill state and spend the same last token.

use super::{refill_tokens, BucketConfig, RateLimiter};
use crate::storage::StorageError;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rate_buckets (
    key TEXT PRIMARY KEY,
    tokens REAL NOT NULL,
    last_refill_ms INTEGER NOT NULL
)";

/// Limiter whose buckets live in a shared SQLite database.
pub struct SharedStoreLimiter {
    config: BucketConfig,
    conn: Mutex<Connection>,
}

impl SharedStoreLimiter {
    /// Open (or create) the bucket store at `path`.
    pub fn open(path: &Path, config: BucketConfig) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, config)
    }

    pub fn in_memory(config: BucketConfig) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: BucketConfig) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            config,
            conn: Mutex::new(conn),
        })
    }

    /// Refill, check and decrement in one immediate transaction.
    pub fn try_acquire_at_ms(&self, key: &str, now_ms: i64) -> Result<bool, rusqlite::Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<(f64, i64)> = tx
            .query_row(
                "SELECT tokens, last_refill_ms FROM rate_buckets WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (tokens, last_ms) = stored.unwrap_or((self.config.capacity, now_ms));
        let elapsed = (now_ms - last_ms).max(0) as f64 / 1000.0;
        let mut tokens = refill_tokens(
            tokens,
            elapsed,
            self.config.rate_per_sec(),
            self.config.capacity,
        );

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        tx.execute(
            "INSERT INTO rate_buckets (key, tokens, last_refill_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 tokens = excluded.tokens,
                 last_refill_ms = excluded.last_refill_ms",
            params![key, tokens, now_ms.max(last_ms)],
        )?;
        tx.commit()?;

        Ok(allowed)
    }
}

impl RateLimiter for SharedStoreLimiter {
    /// Store failures deny the request.
    fn try_acquire(&self, key: &str) -> bool {
        match self.try_acquire_at_ms(key, Utc::now().timestamp_millis()) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Shared rate limiter unavailable for {}: {}", key, e);
                false
            }
        }
    }

    fn blocking_io(&self) -> bool {
        true
    }
}
