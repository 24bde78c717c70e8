//! Wire envelopes exchanged between the relay and its clients.

use serde::{Deserialize, Serialize};

/// Sender name used for relay-generated notices (welcome / leave).
pub const SERVER_SENDER: &str = "Server";

/// Format of [`MessageEnvelope::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// Broadcast envelope, server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender: String,
    pub message: String,
    pub timestamp: String,
}

/// First envelope on a connection, client → server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    #[serde(default)]
    pub username: String,
}

/// Chat line, client → server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(default)]
    pub message: String,
}

/// Current local time as `HH:MM:SS`.
pub fn now_hms() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

impl MessageEnvelope {
    /// Build an envelope stamped with the current local time.
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        MessageEnvelope {
            sender: sender.into(),
            message: message.into(),
            timestamp: now_hms(),
        }
    }

    /// A chat line relayed on behalf of `sender`.
    pub fn chat(sender: &str, text: &str) -> Self {
        Self::new(sender, text)
    }

    /// A relay notice with `sender = "Server"`.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(SERVER_SENDER, text)
    }

    /// Notice announcing a new participant and the current occupancy.
    pub fn welcome(name: &str, occupancy: usize) -> Self {
        Self::system(format!(
            "Welcome {}! There are {} user(s) connected.",
            name, occupancy
        ))
    }

    /// Notice announcing that a participant has gone.
    pub fn leave(name: &str) -> Self {
        Self::system(format!("{} has left the chat!", name))
    }

    pub fn is_system(&self) -> bool {
        self.sender == SERVER_SENDER
    }
}

impl HandshakeEnvelope {
    pub fn new(username: impl Into<String>) -> Self {
        HandshakeEnvelope {
            username: username.into(),
        }
    }
}

impl OutboundEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        OutboundEnvelope {
            message: message.into(),
        }
    }
}
