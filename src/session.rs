//! Server-side handler for one accepted connection.
//!
//! ## Lifecycle
//! 1. `AwaitingHandshake`: read one `{"username": ..}` frame within the
//!    handshake timeout; nothing is registered yet
//! 2. `Active`: registered; every `{"message": ..}` frame is relayed to all
//!    sessions under this session's display name
//! 3. `Closed`: unregistered and the listener slot returned; then the write
//!    half is shut down and the leave notice broadcast
//!
//! Errors never leave the handler's task; the listener only logs the outcome.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::{debug, info, warn};

use crate::codec::FrameReader;
use crate::config::ServerConfig;
use crate::envelope::{HandshakeEnvelope, MessageEnvelope, OutboundEnvelope};
use crate::error::{peer_label, ChatError, Result};
use crate::registry::{shared_writer, ConnId, SharedWriter};
use crate::router::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Active,
    Closed,
}

/// Why an `Active` session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its end of the stream.
    PeerClosed,
    /// Reading from the peer failed.
    ReadError,
    /// The router dropped this session after a failed delivery.
    Pruned,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: String,
    pub relayed: u64,
    pub skipped: u64,
    pub reason: CloseReason,
}

/// Placeholder display name for a handshake without a username.
pub fn placeholder_name(occupancy: usize) -> String {
    format!("User-{}", occupancy + 1)
}

pub struct SessionHandler {
    handle: ConnId,
    peer: Option<SocketAddr>,
    router: Router,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
    state: watch::Sender<SessionState>,
    /// Listener slot, returned as soon as the session leaves the registry.
    slot: Option<OwnedSemaphorePermit>,
}

impl SessionHandler {
    pub fn new(handle: ConnId, router: Router, config: &ServerConfig) -> Self {
        SessionHandler {
            handle,
            peer: None,
            router,
            handshake_timeout: config.handshake_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            state: watch::channel(SessionState::AwaitingHandshake).0,
            slot: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Hold `slot` until this session is unregistered or fails its handshake.
    pub fn with_slot(mut self, slot: OwnedSemaphorePermit) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions after the handler has been moved into its task.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn handle(&self) -> ConnId {
        self.handle
    }

    /// Run the state machine on an accepted TCP connection.
    pub async fn run(self, stream: TcpStream) -> Result<SessionSummary> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        self.run_io(reader, writer).await
    }

    /// Run the state machine on any reader/writer pair.
    pub async fn run_io<R, W>(mut self, reader: R, writer: W) -> Result<SessionSummary>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut frames = FrameReader::new(reader, self.max_frame_bytes);
        let writer = shared_writer(writer);
        let peer = peer_label(self.peer);

        let name = match self.await_handshake(&mut frames).await {
            Ok(name) => name,
            Err(e) => {
                self.close();
                shutdown(&writer).await;
                return Err(e);
            }
        };

        let registry = self.router.registry().clone();
        let session = match registry.register(self.handle, &name, writer.clone()) {
            Ok(session) => session,
            Err(e) => {
                self.close();
                shutdown(&writer).await;
                return Err(e);
            }
        };
        self.state.send_replace(SessionState::Active);
        let occupancy = registry.len();
        info!(session = %self.handle, id = %session.id, name = %name, peer = %peer, occupancy, "joined");

        if let Err(e) = self
            .router
            .broadcast(&MessageEnvelope::welcome(&name, occupancy))
            .await
        {
            warn!(session = %self.handle, error = %e, "welcome broadcast failed");
        }

        let mut relayed = 0u64;
        let reason = loop {
            tokio::select! {
                _ = session.closed() => break CloseReason::Pruned,
                next = frames.next_envelope::<OutboundEnvelope>() => match next {
                    Ok(Some(out)) => {
                        if out.message.is_empty() {
                            continue;
                        }
                        relayed += 1;
                        if let Err(e) = self.router.broadcast(&MessageEnvelope::chat(&name, &out.message)).await {
                            warn!(session = %self.handle, error = %e, "relay failed");
                        }
                    }
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) => {
                        debug!(session = %self.handle, error = %e, "read failed");
                        break CloseReason::ReadError;
                    }
                },
            }
        };

        registry.unregister(self.handle);
        self.close();
        shutdown(&writer).await;
        info!(session = %self.handle, name = %name, ?reason, relayed, "left");

        if let Err(e) = self.router.broadcast(&MessageEnvelope::leave(&name)).await {
            warn!(session = %self.handle, error = %e, "leave broadcast failed");
        }

        Ok(SessionSummary {
            name,
            relayed,
            skipped: frames.skipped(),
            reason,
        })
    }

    /// Enter `Closed` and hand the listener slot back.
    fn close(&mut self) {
        drop(self.slot.take());
        self.state.send_replace(SessionState::Closed);
    }

    /// Read the handshake and resolve the display name.
    async fn await_handshake<R>(&self, frames: &mut FrameReader<R>) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let read = frames.next_envelope::<HandshakeEnvelope>();
        let handshake = match tokio::time::timeout(self.handshake_timeout, read).await {
            Err(_) => {
                warn!(session = %self.handle, peer = %peer_label(self.peer), "handshake timed out");
                return Err(ChatError::HandshakeTimeout(self.handshake_timeout));
            }
            Ok(Ok(Some(handshake))) => handshake,
            Ok(Ok(None)) => {
                return Err(ChatError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed before handshake",
                )))
            }
            Ok(Err(e)) => return Err(e),
        };

        let username = handshake.username.trim();
        if username.is_empty() {
            Ok(placeholder_name(self.router.registry().len()))
        } else {
            Ok(username.to_string())
        }
    }
}

async fn shutdown(writer: &SharedWriter) {
    let _ = writer.lock().await.shutdown().await;
}
