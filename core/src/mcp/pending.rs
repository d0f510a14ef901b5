//! Correlation of outstanding JSON-RPC requests with their responses.

use super::types::JsonRpcResponse;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Outstanding requests keyed by local id.
///
/// `complete` and `abandon` both remove the entry, so exactly one of a
/// response, a timeout or a connection failure settles each request.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Deliver a response; false if the id is unknown or already settled
    pub fn complete(&self, id: u64, response: JsonRpcResponse) -> bool {
        let sender = self.lock().remove(&id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                warn!(target: "mcp_client", id, "Response for unknown or settled request");
                false
            }
        }
    }

    /// Give up on a request (timeout or send failure)
    pub fn abandon(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drop every outstanding sender; waiting callers observe a closed channel
    pub fn fail_all(&self) -> usize {
        let mut map = self.lock();
        let n = map.len();
        map.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
