//! TCP accept loop with a bounded number of session slots.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ServerConfig;
use crate::envelope::MessageEnvelope;
use crate::error::{ChatError, Result};
use crate::registry::{ConnId, ConnectionRegistry};
use crate::router::Router;
use crate::session::SessionHandler;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a refused connection is drained before it is dropped.
const REFUSE_LINGER: Duration = Duration::from_millis(500);

/// The relay server: owns the listening socket, the registry and the router.
pub struct ChatServer {
    listener: TcpListener,
    config: ServerConfig,
    router: Router,
    slots: Arc<Semaphore>,
}

impl ChatServer {
    /// Validate `config` and bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ChatError::connection(&addr, e))?;
        let registry = Arc::new(ConnectionRegistry::new(config.capacity));
        info!(addr = %addr, capacity = config.capacity, "listening");
        Ok(ChatServer {
            listener,
            router: Router::new(registry),
            slots: Arc::new(Semaphore::new(config.capacity)),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(self.router.registry())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running keep going until their peers disconnect.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            // Queue mode: hold the accept until a slot is free.
            let reserved = if self.config.refuse_when_full {
                None
            } else {
                tokio::select! {
                    _ = &mut shutdown => break,
                    permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                }
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        let err = ChatError::connection(self.config.addr(), e);
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit = match reserved {
                Some(permit) => permit,
                None => match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        let err = ChatError::CapacityExceeded {
                            capacity: self.config.capacity,
                        };
                        warn!(peer = %peer, error = %err, "refusing connection");
                        let occupancy = self.router.registry().len();
                        tokio::spawn(refuse(stream, occupancy, self.config.capacity));
                        continue;
                    }
                },
            };

            self.spawn_session(stream, peer, permit);
        }
        info!("listener stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let handle = ConnId::next();
        debug!(session = %handle, peer = %peer, "accepted");
        let handler = SessionHandler::new(handle, self.router.clone(), &self.config)
            .with_peer(peer)
            .with_slot(permit);
        tokio::spawn(async move {
            match handler.run(stream).await {
                Ok(summary) => {
                    debug!(session = %handle, name = %summary.name, relayed = summary.relayed, "session finished")
                }
                Err(e) => warn!(session = %handle, peer = %peer, error = %e, "session ended with error"),
            }
        });
    }
}

/// Slots also cover connections still in their handshake, so `occupancy`
/// can be below `capacity` here.
fn full_notice(occupancy: usize, capacity: usize) -> String {
    format!(
        "Server is full ({} of {} user(s) connected). Try again later.",
        occupancy, capacity
    )
}

/// Tell an over-capacity peer why it is being dropped, then close.
async fn refuse(mut stream: TcpStream, occupancy: usize, capacity: usize) {
    let notice = MessageEnvelope::system(full_notice(occupancy, capacity));
    if let Ok(frame) = codec::encode(&notice) {
        let _ = stream.write_all(&frame).await;
    }
    let _ = stream.shutdown().await;
    // Drain whatever the peer already sent so the close is not a reset.
    let mut sink = [0u8; 512];
    let _ = tokio::time::timeout(REFUSE_LINGER, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}
