//! Durable persistence for document stores
//!
//! Snapshots are stored under a [`StorageKey`] that can only be built from a
//! [`UserId`], so two users can never address the same record. Backends
//! implement [`SnapshotStorage`]; the [`Persister`] binds one store to one
//! key and keeps the durable copy up to date.

mod file;
mod memory;
mod persister;
#[cfg(feature = "sqlite")]
mod schema;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changes::Changes;
use crate::error::PersistenceError;
use crate::identity::UserId;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use persister::{Persister, PersisterSettings};
#[cfg(feature = "sqlite")]
pub use schema::{Schema, SCHEMA_VERSION};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Prefix of server-side snapshot table names
pub const SERVER_KEY_PREFIX: &str = "listmesh";

/// Prefix of client-side snapshot file names
pub const CLIENT_KEY_PREFIX: &str = "listmesh";

/// Current snapshot format
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Name of a durable record. Only constructible from a [`UserId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Server table name: `listmesh_<id>`
    pub fn server(user: &UserId) -> Self {
        Self(format!("{SERVER_KEY_PREFIX}_{user}"))
    }

    /// Client file stem: `listmesh-<id>`
    pub fn client(user: &UserId) -> Self {
        Self(format!("{CLIENT_KEY_PREFIX}-{user}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys embed the user id; keep it out of logs
        let cut = self.0.len().saturating_sub(12);
        write!(f, "{}…", &self.0[..cut])
    }
}

/// Full merge state of a store at save time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    pub saved_at: DateTime<Utc>,
    pub changes: Changes,
}

impl Snapshot {
    pub fn new(changes: Changes) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            changes,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(PersistenceError::SchemaVersionMismatch {
                expected: SNAPSHOT_FORMAT,
                actual: snapshot.format,
            });
        }
        Ok(snapshot)
    }
}

/// Blocking snapshot backend
pub trait SnapshotStorage: Send + Sync {
    /// Read the snapshot stored under `key`, if any
    fn read(&self, key: &StorageKey) -> Result<Option<Snapshot>, PersistenceError>;

    /// Replace the snapshot stored under `key`
    fn write(&self, key: &StorageKey, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_keys_are_exclusive_per_user() {
        let a = user("aaaaaaaaaaaaaaaa");
        let b = user("bbbbbbbbbbbbbbbb");
        assert_eq!(StorageKey::server(&a).as_str(), "listmesh_aaaaaaaaaaaaaaaa");
        assert_eq!(StorageKey::client(&a).as_str(), "listmesh-aaaaaaaaaaaaaaaa");
        assert_ne!(StorageKey::server(&a), StorageKey::server(&b));
        assert_ne!(StorageKey::client(&a), StorageKey::client(&b));
        assert_ne!(StorageKey::server(&a).as_str(), SERVER_KEY_PREFIX);
    }

    #[test]
    fn test_key_display_hides_user_id() {
        let key = StorageKey::server(&user("0123456789abcdef"));
        assert!(!key.to_string().contains("0123456789abcdef"));
    }

    #[test]
    fn test_snapshot_format_is_checked() {
        let mut snapshot = Snapshot::new(Changes::new());
        snapshot.format = 99;
        let json = snapshot.to_json().unwrap();
        assert!(matches!(
            Snapshot::from_json(&json),
            Err(PersistenceError::SchemaVersionMismatch { actual: 99, .. })
        ));
    }
}
