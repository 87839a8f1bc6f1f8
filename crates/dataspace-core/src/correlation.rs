// ── Outstanding request map ──
//
// Generic request/response matching over publish/subscribe: register a
// correlation id before sending, resolve it from a single shared reply
// listener. Registrations that are dropped (timeout, cancelled caller)
// deregister themselves.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

/// Map of correlation id → waiting caller.
pub struct PendingRequests<T> {
    waiters: Arc<DashMap<String, oneshot::Sender<T>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            waiters: Arc::clone(&self.waiters),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`. Must happen before the request is sent.
    pub fn register(&self, id: impl Into<String>) -> PendingReply<T> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.clone(), tx);
        PendingReply {
            id,
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Hand `reply` to the caller waiting on `id`.
    ///
    /// Returns `false` for late or unknown replies, which are dropped.
    pub fn resolve(&self, id: &str, reply: T) -> bool {
        match self.waiters.remove(id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                trace!(correlation_id = id, "no waiter for reply");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// A registered request. Await [`wait`](Self::wait) for the reply;
/// dropping it deregisters the id.
pub struct PendingReply<T> {
    id: String,
    rx: oneshot::Receiver<T>,
    waiters: Arc<DashMap<String, oneshot::Sender<T>>>,
}

impl<T> PendingReply<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout`. `None` on timeout.
    pub async fn wait(mut self, timeout: std::time::Duration) -> Option<T> {
        tokio::time::timeout(timeout, &mut self.rx).await.ok()?.ok()
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.waiters.remove(&self.id);
    }
}
