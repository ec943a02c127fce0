//! # Command Protocol
//!
//! The two one-shot commands peers exchange to start a transfer.
//!
//! ## Handshake
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Request/Response Handshake                         │
//! │                                                                         │
//! │  Requester                                   Responder                 │
//! │     │                                            │                      │
//! │     │  register channel listener                 │                      │
//! │     │──────── DB_SYNC (broadcast) ──────────────►│                      │
//! │     │                                            │ open channel         │
//! │     │◄─────── channel opened on /gdh_db_sync ────│ write JSON batch     │
//! │     │  read to EOF, import                       │ close                │
//! │     │                                            │                      │
//! │  REQUEST_DB_SYNC asks the receiver to run the requester side itself.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands carry no payload; the sender's id travels in the envelope so the
//! responder knows whom to open the channel to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Command
// =============================================================================

/// A sync command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Ask the receiver to become a requester and pull from its peers.
    RequestDbSync,

    /// Ask the receiver to push its data to the sender.
    DbSync,
}

impl Command {
    /// Name used on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Command::RequestDbSync => "REQUEST_DB_SYNC",
            Command::DbSync => "DB_SYNC",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for Command {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST_DB_SYNC" => Ok(Command::RequestDbSync),
            "DB_SYNC" => Ok(Command::DbSync),
            other => Err(SyncError::InvalidMessage(format!("unknown command: {}", other))),
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A command as delivered to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Device id of the sender.
    pub from: String,

    /// The command.
    pub command: Command,

    /// Send time (ms since epoch).
    pub sent_at: i64,
}

impl CommandEnvelope {
    /// Stamps a command from `from` with the current time.
    pub fn new(from: impl Into<String>, command: Command) -> Self {
        CommandEnvelope {
            from: from.into(),
            command,
            sent_at: gluco_core::now_ms(),
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}

// =============================================================================
// Command Sender
// =============================================================================

/// Broadcasts commands to every reachable peer.
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Sends `command` to all peers. Returns how many peers it reached.
    ///
    /// Delivery is fire-and-forget: a peer that is offline is skipped, and
    /// reaching nobody is not an error.
    async fn send_command(&self, command: Command) -> SyncResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Command::DbSync).unwrap(), "\"DB_SYNC\"");
        assert_eq!(
            serde_json::to_string(&Command::RequestDbSync).unwrap(),
            "\"REQUEST_DB_SYNC\""
        );
        assert_eq!("DB_SYNC".parse::<Command>().unwrap(), Command::DbSync);
        assert_eq!(Command::RequestDbSync.to_string(), "REQUEST_DB_SYNC");
        assert!("db_sync".parse::<Command>().is_err());
    }

    #[test]
    fn test_envelope_json() {
        let envelope = CommandEnvelope::new("phone-1", Command::DbSync);
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"sentAt\""));
        assert!(json.contains("\"command\":\"DB_SYNC\""));
        assert_eq!(CommandEnvelope::from_json(&json).unwrap(), envelope);

        let err = CommandEnvelope::from_json(r#"{"from":"x","command":"PING","sentAt":1}"#)
            .unwrap_err();
        assert!(err.is_protocol_error());
    }
}
