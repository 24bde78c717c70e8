//! Client connector: joins a relay and drains broadcasts into a local buffer.
//!
//! [`ClientSession`] is the typed API. [`ChatClient`] wraps it with the
//! bool-returning surface the UI layer polls (`connect`, `send`, `messages`).
//! Receive failures never surface as errors; they clear the connected flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameReader};
use crate::config::ClientConfig;
use crate::envelope::{HandshakeEnvelope, MessageEnvelope, OutboundEnvelope};
use crate::error::{ChatError, Result};

/// How long [`ChatClient::disconnect`] waits for the relay to close its end.
pub const CLOSE_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Local message buffer
// ---------------------------------------------------------------------------

/// Append-only list of received envelopes, shared with the receive task.
#[derive(Clone, Default)]
pub struct MessageBuffer {
    messages: Arc<Mutex<Vec<MessageEnvelope>>>,
    appended: Arc<Notify>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MessageEnvelope>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, envelope: MessageEnvelope) {
        self.lock().push(envelope);
        self.appended.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<MessageEnvelope> {
        self.lock().clone()
    }

    /// Entries from `index` on, for incremental polling.
    pub fn since(&self, index: usize) -> Vec<MessageEnvelope> {
        let guard = self.lock();
        guard[index.min(guard.len())..].to_vec()
    }

    /// Drop everything received so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait until at least `count` entries exist. Returns `false` on timeout.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A live connection to the relay.
pub struct ClientSession {
    name: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    buffer: MessageBuffer,
    connected: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

impl ClientSession {
    /// Connect, send the handshake and start the receive loop.
    pub async fn connect(config: &ClientConfig, name: &str) -> Result<Self> {
        Self::connect_with_buffer(config, name, MessageBuffer::new()).await
    }

    /// Like [`connect`](Self::connect) but appends into an existing buffer.
    pub async fn connect_with_buffer(
        config: &ClientConfig,
        name: &str,
        buffer: MessageBuffer,
    ) -> Result<Self> {
        config.validate()?;
        let addr = config.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ChatError::connection(&addr, e))?;
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();

        codec::write_frame(&mut writer, &HandshakeEnvelope::new(name))
            .await
            .map_err(|e| match e {
                ChatError::Io(io) => ChatError::connection(&addr, io),
                other => other,
            })?;
        info!(addr = %addr, name = %name, "connected");

        let connected = Arc::new(AtomicBool::new(true));
        let receiver = tokio::spawn(receive_loop(
            FrameReader::new(reader, config.max_frame_bytes),
            buffer.clone(),
            Arc::clone(&connected),
        ));

        Ok(ClientSession {
            name: name.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            buffer,
            connected,
            receiver,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one chat line. `false` if disconnected or the write failed.
    pub async fn send(&self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        match codec::write_frame(&mut *writer, &OutboundEnvelope::new(text)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(name = %self.name, error = %e, "send failed");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn messages(&self) -> Vec<MessageEnvelope> {
        self.buffer.snapshot()
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// Close the write side. Frames the relay sends before closing its end
    /// still land in the buffer.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().await.shutdown().await;
        debug!(name = %self.name, "disconnected");
    }

    /// Wait up to `timeout` for the receive loop to reach the end of the
    /// stream. `false` if it is still running.
    pub async fn wait_closed(&mut self, timeout: Duration) -> bool {
        if self.receiver.is_finished() {
            return true;
        }
        tokio::time::timeout(timeout, &mut self.receiver).await.is_ok()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop<R>(mut frames: FrameReader<R>, buffer: MessageBuffer, connected: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.next_envelope::<MessageEnvelope>().await {
            Ok(Some(envelope)) => buffer.push(envelope),
            Ok(None) => {
                debug!("relay closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "receive loop stopped");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Reconnectable client with a buffer that outlives individual sessions.
pub struct ChatClient {
    config: ClientConfig,
    session: Option<ClientSession>,
    buffer: MessageBuffer,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        ChatClient {
            config,
            session: None,
            buffer: MessageBuffer::new(),
        }
    }

    /// Join as `name`, replacing any previous session.
    pub async fn connect(&mut self, name: &str) -> bool {
        self.disconnect().await;
        match ClientSession::connect_with_buffer(&self.config, name, self.buffer.clone()).await {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                warn!(name = %name, error = %e, "connect failed");
                false
            }
        }
    }

    pub async fn send(&self, text: &str) -> bool {
        match &self.session {
            Some(session) => session.send(text).await,
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    pub fn username(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.name())
    }

    pub fn messages(&self) -> Vec<MessageEnvelope> {
        self.buffer.snapshot()
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// Close the write side and keep draining until the relay closes too,
    /// at most [`CLOSE_WAIT`]. The receive loop is aborted after that.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
            if !session.wait_closed(CLOSE_WAIT).await {
                debug!(name = %session.name, "relay did not close in time");
            }
        }
    }
}
