//! Listmesh Core - passphrase-keyed replicated todo lists
//!
//! This crate provides everything both ends of the sync link share:
//!
//! - **Identity**: BIP-39 passphrase validation and deterministic user ids
//! - **Schema**: Typed tables and values for the todo document
//! - **Store**: Replicated document store with per-cell last-writer-wins merge
//! - **Todo**: List, task and cemetery operations on top of the store
//! - **Protocol**: JSON frames exchanged over the sync socket
//! - **Persistence**: Snapshot storage keyed by user and the auto-save binding
//! - **Config**: Server, transport and persistence settings
//!
//! # Merge model
//!
//! Every cell carries a hybrid-logical-clock stamp. Merging keeps the newest
//! stamp per cell, and row deletes leave a tombstone stamp that hides every
//! older cell, so replicas converge regardless of delivery order:
//!
//! ```text
//! replica A ──changes──┐
//!                      ├──> merge (max stamp per cell) ──> same state
//! replica B ──changes──┘
//! ```

pub mod changes;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod todo;

pub use changes::{Change, Changes, Digest, Stamped};
pub use clock::{HybridClock, Stamp};
pub use config::{ConfigError, ListmeshConfig, PersistenceConfig, ServerConfig, SyncConfig};
pub use error::{
    IdentityError, ListmeshError, PersistenceError, Result, StoreError, TransportError,
};
pub use identity::{derive_id, generate_passphrase, is_valid_passphrase, UserId};
#[cfg(feature = "sqlite")]
pub use persistence::SqliteStorage;
pub use persistence::{
    FileStorage, MemoryStorage, Persister, PersisterSettings, Snapshot, SnapshotStorage,
    StorageKey,
};
pub use protocol::SyncMessage;
pub use schema::{CellValue, ColumnType, Row, Schema};
pub use store::{
    lock, shared, ChangeEvent, ChangeSource, DocumentStore, ListenerId, SharedStore, StoreRole,
};

/// Returns the version of listmesh-core
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
