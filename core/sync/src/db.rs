//! SQLite-backed durable state shared by the sync stores.
//!
//! One connection guarded by a mutex; every store holds a cheap clone.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use syncbridge_common::{Error, Result, Source};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS version_vectors (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    source TEXT NOT NULL,
    counter INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id, source)
);

CREATE TABLE IF NOT EXISTS operations (
    operation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT,
    vector_snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_operations_entity
    ON operations(entity_type, entity_id, acknowledged, operation_id);

CREATE TABLE IF NOT EXISTS transactions (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT,
    detail TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_entity
    ON transactions(entity_type, entity_id, row_id);
CREATE INDEX IF NOT EXISTS idx_transactions_id
    ON transactions(transaction_id, row_id);

CREATE TABLE IF NOT EXISTS remote_cursors (
    source TEXT PRIMARY KEY,
    cursor TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Handle to the sync database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Create or open the sync database.
    ///
    /// # Errors
    /// - Database creation or schema migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        let db = Self::init(conn)?;
        info!("Sync database opened at {}", db_path.as_ref().display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for exclusive use.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Database mutex poisoned".to_string()))
    }

    /// Last cursor stored for a remote's change feed.
    pub fn load_cursor(&self, source: Source) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT cursor FROM remote_cursors WHERE source = ?1",
            params![source.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    /// Persist a remote's change-feed cursor.
    pub fn save_cursor(&self, source: Source, cursor: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO remote_cursors (source, cursor, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![source.as_str(), cursor, format_timestamp(&Utc::now())],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

pub(crate) fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Bad timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cursor_round_trip() {
        let db = Database::in_memory().unwrap();
        assert!(db.load_cursor(Source::SystemA).unwrap().is_none());

        db.save_cursor(Source::SystemA, "17").unwrap();
        db.save_cursor(Source::SystemA, "21").unwrap();
        assert_eq!(db.load_cursor(Source::SystemA).unwrap().as_deref(), Some("21"));
        assert!(db.load_cursor(Source::SystemB).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.db");

        {
            let db = Database::open(&path).unwrap();
            db.save_cursor(Source::SystemB, "cursor-1").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.load_cursor(Source::SystemB).unwrap().as_deref(),
            Some("cursor-1")
        );
    }

    #[test]
    fn test_timestamp_format_sorts() {
        let earlier = parse_timestamp("2024-01-15T12:00:00.000001Z").unwrap();
        let later = parse_timestamp("2024-01-15T12:00:01Z").unwrap();
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(parse_timestamp(&format_timestamp(&later)).unwrap(), later);
    }
}
