//! SQLite snapshot storage: one table per storage key in a shared file

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use super::schema::{quote_ident, Schema, SCHEMA_VERSION, SNAPSHOT_ROW_ID};
use super::{Snapshot, SnapshotStorage, StorageKey};
use crate::error::PersistenceError;

/// Snapshot storage in an embedded SQLite database
pub struct SqliteStorage {
    conn: Mutex<rusqlite::Connection>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Open (or create) the database at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self, PersistenceError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize()?;
        Ok(storage)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<(), PersistenceError> {
        let conn = self.conn();
        let current_version = Self::get_schema_version(&conn).unwrap_or(0);

        if current_version == 0 {
            // Fresh database, create all tables
            conn.execute_batch(Schema::create_tables())?;
            Self::set_schema_version(&conn, SCHEMA_VERSION)?;
        } else if current_version != SCHEMA_VERSION {
            return Err(PersistenceError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                actual: current_version,
            });
        }

        Ok(())
    }

    fn get_schema_version(conn: &rusqlite::Connection) -> Option<u32> {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok()
    }

    fn set_schema_version(conn: &rusqlite::Connection, version: u32) -> Result<(), PersistenceError> {
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        Ok(())
    }

    fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool, PersistenceError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Storage keys that have a snapshot table
    pub fn stored_keys(&self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT storage_key FROM snapshot_index ORDER BY storage_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

impl SnapshotStorage for SqliteStorage {
    fn read(&self, key: &StorageKey) -> Result<Option<Snapshot>, PersistenceError> {
        let conn = self.conn();
        if !Self::table_exists(&conn, key.as_str())? {
            return Ok(None);
        }

        let sql = format!(
            "SELECT snapshot FROM {} WHERE id = ?1",
            quote_ident(key.as_str())
        );
        let result = conn.query_row(&sql, [SNAPSHOT_ROW_ID], |row| row.get::<_, String>(0));

        match result {
            Ok(json) => Snapshot::from_json(&json).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &StorageKey, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let json = snapshot.to_json()?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute_batch(&Schema::snapshot_table(key.as_str()))?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, snapshot, saved_at) VALUES (?1, ?2, ?3)",
                quote_ident(key.as_str())
            ),
            rusqlite::params![SNAPSHOT_ROW_ID, json, snapshot.saved_at.to_rfc3339()],
        )?;
        tx.execute(
            r#"
            INSERT INTO snapshot_index (storage_key, created_at, updated_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT(storage_key) DO UPDATE SET updated_at = excluded.updated_at
            "#,
            rusqlite::params![key.as_str(), now],
        )?;
        tx.commit()?;
        Ok(())
    }
}
