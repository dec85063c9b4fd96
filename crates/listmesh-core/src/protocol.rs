//! Sync wire protocol
//!
//! Every WebSocket text frame carries one JSON-encoded [`SyncMessage`].
//!
//! ```text
//! client                          server
//!   | -- digest ------------------> |
//!   | <----------------- changes -- |   what the client lacks
//!   | <------------------ digest -- |
//!   | -- changes -----------------> |   what the server lacks
//!   |        (connected)            |
//!   | <========= changes ========>  |   live updates both ways
//! ```

use serde::{Deserialize, Serialize};

use crate::changes::{Changes, Digest};
use crate::error::TransportError;

/// One sync frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Merge-state summary sent during the handshake
    Digest { digest: Digest },
    /// Merge operations
    Changes { changes: Changes },
}

impl SyncMessage {
    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, TransportError> {
        serde_json::from_str(frame).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}
