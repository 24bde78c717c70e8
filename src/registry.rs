//! Connection registry: the only shared mutable state on the server.
//!
//! ## Design
//! - `Mutex<HashMap<ConnId, Session>>`, locked only for map operations and
//!   never across an `.await`
//! - Each [`Session`] holds a shared handle to its connection's write half;
//!   the session handler owns the read half
//! - [`ConnectionRegistry::snapshot`] hands out clones so broadcasts can write
//!   to sockets without holding the lock

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWrite;
use tokio::sync::Notify;

use crate::error::{ChatError, Result};

/// Write half of a connection, shared between its handler and the router.
pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wrap any writer so it can be stored in a [`Session`].
pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(tokio::sync::Mutex::new(Box::new(writer)))
}

/// Connection handle. Allocated in accept order, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One handshaken connection.
#[derive(Clone)]
pub struct Session {
    pub handle: ConnId,
    /// Random id for log correlation.
    pub id: String,
    pub name: String,
    pub joined_at_ms: u64,
    writer: SharedWriter,
    close: Arc<Notify>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("joined_at_ms", &self.joined_at_ms)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn writer(&self) -> &SharedWriter {
        &self.writer
    }

    /// Ask the owning handler to stop reading and close the connection.
    ///
    /// The signal is stored if the handler is not waiting yet.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// Bounded map of live sessions.
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ConnId, Session>>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        ConnectionRegistry {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Session>> {
        // A panic while holding the guard cannot leave the map half-updated.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session for `handle`.
    ///
    /// Fails with [`ChatError::CapacityExceeded`] when full and
    /// [`ChatError::AlreadyRegistered`] if the handle is present.
    pub fn register(&self, handle: ConnId, name: &str, writer: SharedWriter) -> Result<Session> {
        let mut guard = self.lock();
        if guard.contains_key(&handle) {
            return Err(ChatError::AlreadyRegistered(handle.0));
        }
        if guard.len() >= self.capacity {
            return Err(ChatError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let session = Session {
            handle,
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            joined_at_ms: now_ms(),
            writer,
            close: Arc::new(Notify::new()),
        };
        guard.insert(handle, session.clone());
        Ok(session)
    }

    /// Remove `handle`. No-op when absent.
    pub fn unregister(&self, handle: ConnId) -> Option<Session> {
        self.lock().remove(&handle)
    }

    /// Copy of all sessions in join order.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.handle);
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn contains(&self, handle: ConnId) -> bool {
        self.lock().contains_key(&handle)
    }

    /// Display names in join order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|s| s.name).collect()
    }
}
