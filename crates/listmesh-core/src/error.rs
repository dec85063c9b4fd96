//! Error types for listmesh-core

use thiserror::Error;

/// Result type alias for listmesh operations
pub type Result<T> = std::result::Result<T, ListmeshError>;

/// Main error type for listmesh operations
#[derive(Error, Debug)]
pub enum ListmeshError {
    /// Identity derivation errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Document store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Persistence-related errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Sync transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Identity derivation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The passphrase is not a valid mnemonic. Derivation never falls back
    /// to a default identity.
    #[error("Invalid passphrase: {0}")]
    InvalidPassphrase(String),

    /// A user identifier received from outside is malformed
    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),
}

/// Document store errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Table is not part of the schema
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Column is not part of the table schema
    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    /// Value is not part of the schema
    #[error("Unknown value: {0}")]
    UnknownValue(String),

    /// Cell or value has the wrong scalar type
    #[error("Type mismatch for {field}: expected {expected}")]
    TypeMismatch { field: String, expected: String },

    /// Row id is empty
    #[error("Row id must not be empty (table {0})")]
    MissingRowId(String),

    /// Value may only live on client replicas
    #[error("Value {0} is client-only")]
    ClientOnlyValue(String),
}

/// Persistence-specific errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Schema version mismatch
    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },

    /// Background I/O task failed to complete
    #[error("Persistence task failed: {0}")]
    TaskJoin(String),
}

/// Sync transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection attempt or handshake did not finish in time
    #[error("Connection timed out after {0} ms")]
    ConnectionTimeout(u64),

    /// Socket-level failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Peer sent something that is not a sync frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server URL cannot be used as a sync endpoint
    #[error("Invalid server url: {0}")]
    InvalidServerUrl(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Database(err.to_string())
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PersistenceError {
    fn from(err: tokio::task::JoinError) -> Self {
        PersistenceError::TaskJoin(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ListmeshError {
    fn from(err: rusqlite::Error) -> Self {
        ListmeshError::Persistence(PersistenceError::Database(err.to_string()))
    }
}

impl From<serde_json::Error> for ListmeshError {
    fn from(err: serde_json::Error) -> Self {
        ListmeshError::Persistence(PersistenceError::Serialization(err.to_string()))
    }
}
