//! # nyaya-chat
//!
//! Real-time two-party messaging for the Nyaya legal assistant.
//!
//! - [`listener::ChatServer`] accepts up to `capacity` TCP connections and
//!   runs a [`session::SessionHandler`] task per connection
//! - [`registry::ConnectionRegistry`] tracks handshaken sessions
//! - [`router::Router`] fans each envelope out to every registered session
//! - [`client::ChatClient`] connects as one participant and drains broadcasts
//!   into a [`client::MessageBuffer`] the UI polls
//!
//! Frames are newline-delimited JSON; see [`codec`].

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod registry;
pub mod router;
pub mod session;

pub use client::{ChatClient, ClientSession, MessageBuffer};
pub use config::{ChatConfig, ClientConfig, ServerConfig};
pub use envelope::{HandshakeEnvelope, MessageEnvelope, OutboundEnvelope};
pub use error::{ChatError, Result};
pub use listener::ChatServer;
pub use registry::{ConnId, ConnectionRegistry, Session};
pub use router::{BroadcastReport, Router};
pub use session::{SessionHandler, SessionState};
