//! Conditional-request cache.
//!
//! Entries hold the validator a server sent with a 200 response plus the body,
//! so the next request can ask "has this changed?" and reuse the stored body
//! on a 304.

pub mod sqlite;

pub use sqlite::SqliteCache;

use crate::fetch::transport::ApiResponse;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque freshness tokens returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validator {
    pub fn from_response(response: &ApiResponse) -> Self {
        Self {
            etag: response.header("etag").map(String::from),
            last_modified: response.header("last-modified").map(String::from),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Conditional request headers for this validator.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(ref etag) = self.etag {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(ref modified) = self.last_modified {
            headers.push(("If-Modified-Since".to_string(), modified.clone()));
        }
        headers
    }
}

/// A memoized response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub validator: Validator,
    pub payload: String,
    /// Next-page link sent with the payload; a 304 usually omits it.
    #[serde(default)]
    pub next_link: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Shared cache of conditional-fetch entries.
///
/// Implementations make each single-key mutation atomic with the read that
/// decided it. Cache failures are never fatal to a fetch.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store a fresh 200 response. An entry never replaces a newer one.
    fn put(&self, key: &str, entry: CacheEntry);

    /// Mark an entry as confirmed fresh at `at` without touching its payload.
    fn touch(&self, key: &str, at: DateTime<Utc>);

    /// Whether calls wait on file locks and must stay off async workers.
    fn blocking_io(&self) -> bool {
        false
    }
}

/// Process-local cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if existing.fetched_at > entry.fetched_at => {}
            _ => {
                entries.insert(key.to_string(), entry);
            }
        }
    }

    fn touch(&self, key: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            if at > entry.fetched_at {
                entry.fetched_at = at;
            }
        }
    }
}

/// Cache that stores nothing.
pub struct NoCache;

impl CacheStore for NoCache {
    fn get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    fn put(&self, _key: &str, _entry: CacheEntry) {}

    fn touch(&self, _key: &str, _at: DateTime<Utc>) {}
}
