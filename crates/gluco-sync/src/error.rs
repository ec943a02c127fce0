//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  MissingDeviceId│  │  PeerNotFound   │  │  InvalidPayload         │ │
//! │  │  InvalidUrl     │  │  UnknownChannel │  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │     Store       │  │                Internal                     │  │
//! │  │                 │  │                                             │  │
//! │  │  StoreFailed    │  │  ShuttingDown, ChannelError, Internal       │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  None of these is fatal to the process: every background worker logs   │
//! │  the error and lets the requester's wait/retry loop recover.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid peer URL.
    #[error("Invalid peer URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish a connection to a peer.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer disconnected unexpectedly.
    #[error("Disconnected from peer")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// No route to the requested peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Channel is not (or no longer) open on this transport.
    #[error("Unknown channel: {0}")]
    UnknownChannel(u64),

    /// The requested stream half was already handed out.
    #[error("{stream} stream of channel {channel} already taken")]
    StreamTaken {
        channel: u64,
        stream: &'static str,
    },

    /// Stream I/O failed mid-transfer.
    #[error("Channel I/O error: {0}")]
    Io(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid command message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Received record payload could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Record store operation failed.
    #[error("Record store error: {0}")]
    StoreFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Coordinator is shutting down.
    #[error("Sync coordinator is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<gluco_db::DbError> for SyncError {
    fn from(err: gluco_db::DbError) -> Self {
        match err {
            gluco_db::DbError::InvalidPayload(msg) => SyncError::InvalidPayload(msg),
            other => SyncError::StoreFailed(other.to_string()),
        }
    }
}

impl From<gluco_core::CoreError> for SyncError {
    fn from(err: gluco_core::CoreError) -> Self {
        SyncError::InvalidPayload(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if a fresh attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::Io(_)
                | SyncError::InvalidPayload(_)
                | SyncError::UnknownChannel(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::InvalidPayload(_)
                | SyncError::SerializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::InvalidPayload("truncated".into()).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(!SyncError::PeerNotFound("watch".into()).is_retryable());
    }

    #[test]
    fn test_db_payload_error_maps_to_protocol_error() {
        let err: SyncError = gluco_db::DbError::InvalidPayload("EOF".into()).into();
        assert!(matches!(err, SyncError::InvalidPayload(_)));
        assert!(err.is_protocol_error());

        let err: SyncError = gluco_db::DbError::PoolExhausted.into();
        assert!(matches!(err, SyncError::StoreFailed(_)));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::StreamTaken {
            channel: 7,
            stream: "input",
        };
        assert_eq!(err.to_string(), "input stream of channel 7 already taken");
    }
}
