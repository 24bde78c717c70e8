//! Broadcast fan-out over the connection registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::codec;
use crate::envelope::MessageEnvelope;
use crate::error::{ChatError, Result};
use crate::registry::{ConnId, ConnectionRegistry, Session};

/// A peer that cannot take a frame within this window is treated as failed.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one [`Router::broadcast`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions dropped from the registry because the write failed.
    pub pruned: Vec<ConnId>,
}

/// Delivers envelopes to every registered session.
#[derive(Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Router { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send `envelope` to every session in a point-in-time snapshot.
    ///
    /// A failed write does not stop delivery to the rest; failed sessions are
    /// unregistered after the pass and told to close.
    pub async fn broadcast(&self, envelope: &MessageEnvelope) -> Result<BroadcastReport> {
        let frame = codec::encode(envelope)?;
        let sessions = self.registry.snapshot();
        let mut report = BroadcastReport::default();
        let mut failed: Vec<Session> = Vec::new();

        for session in sessions {
            match deliver(&session, &frame).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session = %session.handle, name = %session.name, error = %e, "delivery failed");
                    failed.push(session);
                }
            }
        }

        for session in failed {
            self.registry.unregister(session.handle);
            session.request_close();
            report.pruned.push(session.handle);
        }

        debug!(
            sender = %envelope.sender,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            "broadcast"
        );
        Ok(report)
    }
}

async fn deliver(session: &Session, frame: &[u8]) -> Result<()> {
    let write = async {
        let mut writer = session.writer().lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    };
    let detail = match tokio::time::timeout(SEND_TIMEOUT, write).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", SEND_TIMEOUT),
    };
    Err(ChatError::SendFailure {
        session: session.handle.to_string(),
        detail,
    })
}
