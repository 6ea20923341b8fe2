//! # Streaming Errors
//!
//! Error types shared by the streaming core and the connection handler.

use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Streaming errors
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    // ==================
    // Protocol Errors
    // ==================
    /// Client sent a key-set that does not decode
    #[error("Invalid key set: {0}")]
    InvalidKeySet(String),

    /// Client sent a frame that is not a valid startup message
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ==================
    // Listener Errors
    // ==================
    /// A change notification payload could not be decoded
    #[error("Undecodable change notification on {channel}: {reason}")]
    Decode { channel: String, reason: String },

    /// The change-notification stream ended
    #[error("Change listener on {0} closed")]
    ListenerClosed(String),

    /// Keepalive ping on a change listener failed
    #[error("Change listener on {channel} failed keepalive: {reason}")]
    PingFailed { channel: String, reason: String },

    /// The publisher set this connection was attached to went away
    #[error("Publisher set is down")]
    PublisherSetDown,

    // ==================
    // Query Errors
    // ==================
    /// Reconciliation or hydration query failed
    #[error("Query failed: {0}")]
    Query(String),

    // ==================
    // Connection Errors
    // ==================
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Socket write or read failed
    #[error("Transport error: {0}")]
    Transport(String),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Returns the close code for WebSocket
    pub fn close_code(&self) -> u16 {
        match self {
            StreamError::ConnectionClosed => 1000,
            StreamError::InvalidMessage(_) => 1003,
            StreamError::InvalidKeySet(_) => 4000,
            StreamError::PublisherSetDown => 1012,
            StreamError::Transport(_) => 4502,
            StreamError::Query(_) => 4510,
            StreamError::Decode { .. }
            | StreamError::ListenerClosed(_)
            | StreamError::PingFailed { .. } => 4511,
            StreamError::Config(_) => 4501,
            StreamError::Internal(_) => 4500,
        }
    }

    /// Protocol errors are the client's fault; the connection is closed without retry.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidKeySet(_) | StreamError::InvalidMessage(_)
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::InvalidMessage(e.to_string())
    }
}
