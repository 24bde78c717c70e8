use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;

use crate::config::{ClientConfig, ServerConfig};
use crate::envelope::MessageEnvelope;

#[derive(Parser, Debug)]
#[command(name = "nyaya-chat")]
#[command(version)]
#[command(about = "Two-party real-time chat relay for the Nyaya legal assistant")]
pub struct Args {
    /// TOML config file; missing file means built-in defaults
    #[arg(long, global = true, default_value = "nyaya-chat.toml")]
    pub config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server until Ctrl-C
    Serve(ServeArgs),
    /// Join a relay and chat from the terminal
    Connect(ConnectArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (overrides config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent participants
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Milliseconds a new connection has to send its handshake
    #[arg(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// Hold new connections until a slot frees instead of refusing them
    #[arg(long)]
    pub queue_when_full: bool,
}

impl ServeArgs {
    /// Layer command-line values over `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = ms;
        }
        if self.queue_when_full {
            config.refuse_when_full = false;
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ConnectArgs {
    /// Display name announced to the other participant
    pub name: String,

    /// Relay host (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Relay port (overrides config)
    #[arg(long)]
    pub port: Option<u16>,
}

impl ConnectArgs {
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

/// One buffer entry as a terminal line: relay notices, own lines and peer
/// lines are styled differently.
pub fn render_message(envelope: &MessageEnvelope, own_name: &str) -> String {
    let stamp = format!("[{}]", envelope.timestamp).dimmed();
    if envelope.is_system() {
        format!("{} {}", stamp, envelope.message.yellow())
    } else if envelope.sender == own_name {
        format!("{} {}: {}", stamp, envelope.sender.green().bold(), envelope.message)
    } else {
        format!("{} {}: {}", stamp, envelope.sender.cyan().bold(), envelope.message)
    }
}
