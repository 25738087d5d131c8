//! Request/response correlation
//!
//! Layered on plain message delivery: an outbound request registers a
//! pending handle under its correlation id and races the response against a
//! timeout. Inbound messages whose id matches a pending handle are responses;
//! everything else is a request for the registered handler.

use crate::events::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::trace;

/// Failure a request handler reports back to the requesting peer.
///
/// Serialized into the response payload together with the responding
/// engine's own address, so the requester can attribute the failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The single handler invoked for inbound requests. Its result becomes the
/// outgoing response payload.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Message) -> Result<serde_json::Value, HandlerError>;
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    pending: DashMap<String, oneshot::Sender<Message>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending handle for an outbound request id. A later
    /// registration under the same id replaces the earlier one.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        rx
    }

    /// Try to settle a pending request with an inbound message. Returns
    /// false when no handle matches - the message is a request, not a
    /// response to something this engine sent.
    pub fn resolve(&self, id: &str, response: Message) -> bool {
        let Some((_, handle)) = self.pending.remove(id) else {
            trace!(id, "inbound message matches no pending request");
            return false;
        };
        let _ = handle.send(response);
        true
    }

    /// Whether a request with this id is still awaiting its response.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Drop a pending handle, e.g. after its timeout fired.
    pub fn remove(&self, id: &str) {
        self.pending.remove(id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(id: &str) -> Message {
        let mut message = Message::new("g.crypto.ripple.rALICE", serde_json::json!({"ok": true}));
        message.id = Some(id.to_string());
        message
    }

    #[tokio::test]
    async fn test_response_resolves_pending_request() {
        let pending = PendingRequests::new();
        let rx = pending.register("req-1");

        assert!(pending.resolve("req-1", response("req-1")));
        let settled = rx.await.unwrap();
        assert_eq!(settled.data, serde_json::json!({"ok": true}));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_message_is_a_request() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("unknown", response("unknown")));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let pending = PendingRequests::new();
        let rx = pending.register("req-2");

        let raced = tokio::time::timeout(Duration::from_millis(50), rx).await;
        assert!(raced.is_err());
        pending.remove("req-2");
        assert!(!pending.contains("req-2"));
    }
}
