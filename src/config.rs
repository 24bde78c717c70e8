//! Server and client settings, loadable from TOML.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8051
//! capacity = 2
//! handshake_timeout_ms = 5000
//!
//! [client]
//! host = "127.0.0.1"
//! port = 8051
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{ChatError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8051;
/// Two-party chat: the relay holds at most this many sessions by default.
pub const DEFAULT_CAPACITY: usize = 2;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of concurrently registered sessions.
    pub capacity: usize,
    pub handshake_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Close connections that arrive while full instead of leaving them
    /// queued until a slot frees.
    pub refuse_when_full: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            capacity: DEFAULT_CAPACITY,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            refuse_when_full: true,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ChatError::Config("server.host must not be empty".into()));
        }
        if self.capacity == 0 {
            return Err(ChatError::Config("server.capacity must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ChatError::Config(
                "server.max_frame_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ChatError::Config("client.host must not be empty".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ChatError::Config(
                "client.max_frame_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level config file shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl ChatConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ChatConfig =
            toml::from_str(raw).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(ChatConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()
    }
}
