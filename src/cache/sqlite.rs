//! SQLite-backed conditional-request cache.
//!
//! Survives across runs, so a second analysis of the same subject mostly
//! receives 304 responses.

use super::{CacheEntry, CacheStore, Validator};
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS http_cache (
    key TEXT PRIMARY KEY,
    etag TEXT,
    last_modified TEXT,
    payload TEXT NOT NULL,
    next_link TEXT,
    fetched_at_us INTEGER NOT NULL
)";

/// Persistent cache in a single SQLite file.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!("Opening HTTP cache at {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `<user cache dir>/fairscore/cache.sqlite`, if a cache dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("fairscore").join("cache.sqlite"))
    }

    fn read(&self, key: &str) -> rusqlite::Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT etag, last_modified, payload, next_link, fetched_at_us FROM http_cache WHERE key = ?1",
            params![key],
            |row| {
                let micros: i64 = row.get(4)?;
                Ok(CacheEntry {
                    validator: Validator {
                        etag: row.get(0)?,
                        last_modified: row.get(1)?,
                    },
                    payload: row.get(2)?,
                    next_link: row.get(3)?,
                    fetched_at: DateTime::from_timestamp_micros(micros).unwrap_or_default(),
                })
            },
        )
        .optional()
    }

    fn write(&self, key: &str, entry: &CacheEntry) -> rusqlite::Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO http_cache (key, etag, last_modified, payload, next_link, fetched_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                 etag = excluded.etag,
                 last_modified = excluded.last_modified,
                 payload = excluded.payload,
                 next_link = excluded.next_link,
                 fetched_at_us = excluded.fetched_at_us
             WHERE excluded.fetched_at_us >= http_cache.fetched_at_us",
            params![
                key,
                entry.validator.etag,
                entry.validator.last_modified,
                entry.payload,
                entry.next_link,
                entry.fetched_at.timestamp_micros()
            ],
        )
    }

    fn refresh(&self, key: &str, at: DateTime<Utc>) -> rusqlite::Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE http_cache SET fetched_at_us = MAX(fetched_at_us, ?2) WHERE key = ?1",
            params![key, at.timestamp_micros()],
        )
    }
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.read(key).unwrap_or_else(|e| {
            warn!("Cache read failed for {}: {}", key, e);
            None
        })
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        if let Err(e) = self.write(key, &entry) {
            warn!("Cache write failed for {}: {}", key, e);
        }
    }

    fn touch(&self, key: &str, at: DateTime<Utc>) {
        if let Err(e) = self.refresh(key, at) {
            warn!("Cache refresh failed for {}: {}", key, e);
        }
    }

    fn blocking_io(&self) -> bool {
        true
    }
}
