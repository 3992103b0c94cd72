//! Embedded SQLite storage.

use super::{StorageBackend, StorageError};
use crate::models::{ContributionEvent, Score};
use chrono::SecondsFormat;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fs_events (
    id TEXT NOT NULL,
    kind TEXT NOT NULL,
    repo TEXT NOT NULL,
    actor TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_bot INTEGER NOT NULL DEFAULT 0,
    is_self_repo INTEGER NOT NULL DEFAULT 0,
    source_host TEXT NOT NULL DEFAULT 'github.com',
    PRIMARY KEY (kind, repo, id)
);
CREATE TABLE IF NOT EXISTS fs_scores (
    subject TEXT NOT NULL,
    dimension TEXT NOT NULL,
    window_since TEXT NOT NULL,
    window_until TEXT NOT NULL,
    value REAL NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (subject, dimension, window_since, window_until)
);";

fn rfc3339(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening sqlite storage at {}", path.display());
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    #[cfg(test)]
    fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn save_events(&mut self, events: &[ContributionEvent]) -> Result<usize, StorageError> {
        if events.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO fs_events
                     (id, kind, repo, actor, created_at, is_bot, is_self_repo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for e in events {
                inserted += stmt.execute(params![
                    e.id,
                    e.kind.as_str(),
                    e.repo.full_name(),
                    e.actor,
                    rfc3339(&e.timestamp),
                    e.is_bot,
                    e.is_self_repo
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} of {} event(s)", inserted, events.len());
        Ok(inserted)
    }

    fn save_scores(&mut self, scores: &[Score]) -> Result<usize, StorageError> {
        if scores.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fs_scores
                     (subject, dimension, window_since, window_until, value, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(subject, dimension, window_since, window_until) DO UPDATE SET
                     value = excluded.value,
                     computed_at = excluded.computed_at",
            )?;
            for s in scores {
                stmt.execute(params![
                    s.subject,
                    s.dimension,
                    rfc3339(&s.window.since),
                    rfc3339(&s.window.until),
                    s.value,
                    rfc3339(&s.computed_at)
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} score(s)", scores.len());
        Ok(scores.len())
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, Repo, Window};
    use chrono::{TimeZone, Utc};

    fn event(id: &str, kind: EventKind) -> ContributionEvent {
        ContributionEvent {
            id: id.to_string(),
            kind,
            repo: Repo::new("octo", "hello"),
            actor: "octo".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
            is_bot: false,
            is_self_repo: true,
        }
    }

    fn score(dimension: &str, value: f64) -> Score {
        let until = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        Score {
            subject: "octo".to_string(),
            dimension: dimension.to_string(),
            window: Window::new(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(), until),
            value,
            computed_at: until,
        }
    }

    fn storage() -> SqliteStorage {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.ensure_schema().unwrap();
        storage
    }

    #[test]
    fn test_events_are_inserted_once() {
        let mut storage = storage();
        let events = vec![event("1", EventKind::Pr), event("1", EventKind::Issue)];
        assert_eq!(storage.save_events(&events).unwrap(), 2);
        assert_eq!(storage.save_events(&events).unwrap(), 0);
        assert_eq!(storage.count("fs_events"), 2);
        assert_eq!(storage.save_events(&[]).unwrap(), 0);
    }

    #[test]
    fn test_scores_upsert() {
        let mut storage = storage();
        storage.save_scores(&[score("code", 1.0), score("review", 0.0)]).unwrap();
        storage.save_scores(&[score("code", 2.5)]).unwrap();
        assert_eq!(storage.count("fs_scores"), 2);

        let value: f64 = storage
            .conn
            .query_row("SELECT value FROM fs_scores WHERE dimension = 'code'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 2.5);
    }

    #[test]
    fn test_schema_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fs.db");

        let mut first = SqliteStorage::open(&path).unwrap();
        first.ensure_schema().unwrap();
        first.save_events(&[event("a", EventKind::Commit)]).unwrap();
        Box::new(first).close().unwrap();

        let mut second = SqliteStorage::open(&path).unwrap();
        second.ensure_schema().unwrap();
        assert_eq!(second.count("fs_events"), 1);
    }
}
