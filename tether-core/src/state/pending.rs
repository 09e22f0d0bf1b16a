//! Outstanding requests awaiting a correlated reply.
//!
//! Every entry is claimed exactly once: either by the reply (through
//! [`PendingRequests::complete`]) or by its waiter on timeout. The claim is
//! the atomic removal from the table, so the two can never both win.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::TetherError;

type Table = Arc<DashMap<String, oneshot::Sender<Bytes>>>;

/// Request id → reply slot. Cloning shares the table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    table: Table,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `request_id`; the waiter resolves with the raw reply.
    pub fn register(&self, request_id: &str) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        self.table.insert(request_id.to_string(), tx);
        ResponseWaiter {
            request_id: request_id.to_string(),
            rx,
            table: Arc::clone(&self.table),
        }
    }

    /// Deliver `reply` to the waiter of `request_id`.
    ///
    /// Returns `false` if nothing was waiting (unknown id, already timed
    /// out, or already completed).
    pub fn complete(&self, request_id: &str, reply: Bytes) -> bool {
        match self.table.remove(request_id) {
            Some((_, tx)) => {
                trace!(request_id, "pending request completed");
                tx.send(reply).is_ok()
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.table.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Drop every entry; their waiters fail with `ConnectionClosed`.
    pub fn cancel_all(&self) -> usize {
        let count = self.table.len();
        self.table.clear();
        count
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.table.len())
            .finish()
    }
}

// ── ResponseWaiter ───────────────────────────────────────────────

/// The receiving side of one pending request.
///
/// Dropping a waiter stops tracking its request.
pub struct ResponseWaiter {
    request_id: String,
    rx: oneshot::Receiver<Bytes>,
    table: Table,
}

impl ResponseWaiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the reply, or until `timeout` elapses (`None` waits forever).
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Bytes, TetherError> {
        let Some(limit) = timeout else {
            return (&mut self.rx)
                .await
                .map_err(|_| TetherError::ConnectionClosed);
        };
        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(reply) => reply.map_err(|_| TetherError::ConnectionClosed),
            Err(_) => {
                if self.table.remove(&self.request_id).is_some() {
                    trace!(request_id = %self.request_id, "pending request timed out");
                    Err(TetherError::Timeout(limit))
                } else {
                    // The reply claimed the entry first; it is on its way.
                    (&mut self.rx)
                        .await
                        .map_err(|_| TetherError::ConnectionClosed)
                }
            }
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}
