//! Crate-level error type.
//!
//! Every fallible operation in the relay returns [`ChatError`]. The server
//! never lets one of these escape a session task; the client folds them into
//! its disconnected flag.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors produced by the codec, registry, listener and client connector.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Bind, accept or connect failed.
    #[error("connection error on {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer did not send its handshake in time.
    #[error("handshake not received within {0:?}")]
    HandshakeTimeout(Duration),

    /// The registry already holds `capacity` sessions.
    #[error("capacity of {capacity} session(s) exceeded")]
    CapacityExceeded { capacity: usize },

    /// The connection handle is already present in the registry.
    #[error("session {0} is already registered")]
    AlreadyRegistered(u64),

    /// A frame could not be decoded into the expected envelope.
    #[error("malformed frame: {0}")]
    Decode(String),

    /// Writing a frame to one peer failed.
    #[error("send to session {session} failed: {detail}")]
    SendFailure { session: String, detail: String },

    /// Invalid configuration value or unreadable config file.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Wrap an I/O error with the address it occurred on.
    pub fn connection(addr: impl ToString, source: std::io::Error) -> Self {
        ChatError::Connection {
            addr: addr.to_string(),
            source,
        }
    }

    /// Whether the error is one the caller should treat as "skip and continue".
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Decode(_) | ChatError::SendFailure { .. })
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Format a peer address for log fields when one may be missing.
pub(crate) fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
