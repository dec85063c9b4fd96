//! Configuration for listmesh
//!
//! Centralized configuration for the sync server, the client transport and
//! the persistence adapter. Every section has defaults, so a partial TOML
//! file only needs the keys it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// System-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListmeshConfig {
    /// Sync server settings
    pub server: ServerConfig,
    /// Client transport settings
    pub sync: SyncConfig,
    /// Persistence timing and failure policy
    pub persistence: PersistenceConfig,
}

/// Sync server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind_addr: String,
    /// SQLite database file; `None` uses the platform data directory
    pub database_path: Option<PathBuf>,
    /// Externally visible base URL, reported by the health endpoint
    pub public_url: Option<String>,
    /// Evict a user's store after this long without connections
    pub idle_eviction_secs: u64,
    /// How often the eviction sweeper runs
    pub eviction_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8043".to_string(),
            database_path: None,
            public_url: None,
            idle_eviction_secs: 1800,
            eviction_sweep_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Database file to open
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// Client transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base WebSocket URL of the sync server
    pub server_url: String,
    /// Delay before the single reconnect attempt after a drop
    pub reconnect_delay_ms: u64,
    /// Bound on connecting plus the handshake
    pub connect_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8043".to_string(),
            reconnect_delay_ms: 3000,
            connect_timeout_ms: 5000,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub autosave_debounce_ms: u64,
    /// Zero disables polling
    pub autoload_interval_ms: u64,
    pub failure_warning_threshold: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            autosave_debounce_ms: 250,
            autoload_interval_ms: 5000,
            failure_warning_threshold: 3,
        }
    }
}

/// `<data_dir>/listmesh/listmesh.db`, falling back to the working directory
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("listmesh"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("listmesh.db")
}

impl ListmeshConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Read a TOML (or `.json`) file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Self::from_toml(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(ConfigError::MissingField("server.bind_addr".to_string()));
        }

        if self.server.eviction_sweep_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "eviction_sweep_secs must be positive".to_string(),
            ));
        }

        if !self.sync.server_url.starts_with("ws://") && !self.sync.server_url.starts_with("wss://")
        {
            return Err(ConfigError::OutOfRange(
                "server_url must use ws:// or wss://".to_string(),
            ));
        }

        if self.sync.connect_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }

        if self.persistence.failure_warning_threshold == 0 {
            return Err(ConfigError::OutOfRange(
                "failure_warning_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration loading or validation error
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Value is out of valid range
    OutOfRange(String),
    /// Required field is missing
    MissingField(String),
    /// File could not be parsed
    Parse(String),
    /// File could not be read
    Io(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::OutOfRange(msg) => write!(f, "Value out of range: {}", msg),
            ConfigError::MissingField(msg) => write!(f, "Missing field: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::Io(msg) => write!(f, "Cannot read config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
