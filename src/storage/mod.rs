//! Persistence of events and scores.
//!
//! Backends are chosen by DSN. Only the embedded SQLite backend is linked
//! in; server databases are recognized and reported as unavailable.

pub mod sqlite;

pub use sqlite::SqliteStorage;

use crate::models::{ContributionEvent, Score};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unsupported storage DSN: {0}")]
    UnsupportedDsn(String),

    #[error("Storage backend {backend} is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a synchronous SQLite call on tokio's blocking pool.
///
/// `None` if the task panicked or was cancelled.
pub async fn off_runtime<T, F>(f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Blocking store task failed: {}", e);
            None
        }
    }
}

/// A place to persist events and scores.
pub trait StorageBackend: Send {
    /// Create tables if they do not exist yet. Safe to call repeatedly.
    fn ensure_schema(&mut self) -> Result<(), StorageError>;

    /// Insert events, ignoring ones already stored. Returns how many were new.
    fn save_events(&mut self, events: &[ContributionEvent]) -> Result<usize, StorageError>;

    /// Insert or replace scores keyed by subject, dimension and window.
    fn save_scores(&mut self, scores: &[Score]) -> Result<usize, StorageError>;

    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Where a DSN points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    SqliteMemory,
    SqliteFile(PathBuf),
    Postgres,
}

impl Dsn {
    pub fn parse(dsn: &str) -> Result<Self, StorageError> {
        let trimmed = dsn.trim();
        if let Some(rest) = trimmed.strip_prefix("sqlite:///") {
            return match rest {
                "" => Err(StorageError::UnsupportedDsn(dsn.to_string())),
                ":memory:" => Ok(Dsn::SqliteMemory),
                path => Ok(Dsn::SqliteFile(PathBuf::from(path))),
            };
        }
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            return Ok(Dsn::Postgres);
        }
        Err(StorageError::UnsupportedDsn(dsn.to_string()))
    }
}

/// Open the backend a DSN names, with its schema in place.
///
/// `sqlite:///relative.db`, `sqlite:////absolute.db` and
/// `sqlite:///:memory:` are served.
pub fn open_backend(dsn: &str) -> Result<Box<dyn StorageBackend>, StorageError> {
    let mut backend: Box<dyn StorageBackend> = match Dsn::parse(dsn)? {
        Dsn::SqliteMemory => Box::new(SqliteStorage::in_memory()?),
        Dsn::SqliteFile(path) => Box::new(SqliteStorage::open(&path)?),
        Dsn::Postgres => {
            return Err(StorageError::Unavailable {
                backend: "postgres".to_string(),
                reason: "this build only links the sqlite backend".to_string(),
            })
        }
    };
    backend.ensure_schema()?;
    debug!("Opened storage backend for {}", dsn);
    Ok(backend)
}
