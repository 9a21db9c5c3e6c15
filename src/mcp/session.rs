//! Registry of live streaming sessions.
//!
//! The only state shared between connections: the streaming-open flow
//! registers, the message-post flow looks up and the close flow deregisters.
//! Every operation is a single map access, so they stay linearizable with
//! respect to each other without an outer lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::protocol::JsonRpcMessage;
use crate::metrics;

/// Route into one live streaming transport.
#[derive(Debug, Clone)]
pub struct StreamingHandle {
    sender: mpsc::Sender<JsonRpcMessage>,
    cancel: CancellationToken,
}

impl StreamingHandle {
    pub fn new(sender: mpsc::Sender<JsonRpcMessage>, cancel: CancellationToken) -> Self {
        Self { sender, cancel }
    }

    /// Hand a client message to the session's protocol server.
    pub async fn post(&self, message: JsonRpcMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }
}

/// Session id to live transport.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, StreamingHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails if `id` is already present.
    pub fn register(&self, id: &str, handle: StreamingHandle) -> Result<()> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateSession(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                metrics::session_opened();
                debug!("Registered session {}", id);
                Ok(())
            }
        }
    }

    /// Find the transport for `id`.
    pub fn lookup(&self, id: &str) -> Result<StreamingHandle> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Remove `id`. Unknown ids are ignored.
    pub fn deregister(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            metrics::session_closed();
            debug!("Deregistered session {}", id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcNotification, JSONRPC_VERSION};
    use std::sync::Arc;

    fn handle() -> (StreamingHandle, mpsc::Receiver<JsonRpcMessage>, CancellationToken) {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        (StreamingHandle::new(tx, cancel.clone()), rx, cancel)
    }

    fn initialized() -> JsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: "notifications/initialized".to_string(),
            params: None,
        })
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = SessionRegistry::new();
        let (first, _rx1, _) = handle();
        let (second, _rx2, _) = handle();

        registry.register("s1", first).unwrap();
        let err = registry.register("s1", second).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession(id) if id == "s1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        let registry = SessionRegistry::new();
        let err = registry.lookup("missing").unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (h, _rx, _) = handle();
        registry.register("s1", h).unwrap();

        registry.deregister("s1");
        registry.deregister("s1");
        registry.deregister("never-registered");

        assert!(registry.is_empty());
        assert!(registry.lookup("s1").is_err());
    }

    #[tokio::test]
    async fn test_post_routes_to_registered_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a, _) = handle();
        let (b, mut rx_b, _) = handle();
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();

        registry.lookup("a").unwrap().post(initialized()).await.unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_post_after_cancel_is_transport_closed() {
        let (h, _rx, cancel) = handle();
        cancel.cancel();
        assert!(h.is_closed());
        assert!(matches!(h.post(initialized()).await, Err(Error::TransportClosed)));

        let (h, rx, _) = handle();
        drop(rx);
        assert!(matches!(h.post(initialized()).await, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (h, rx, _) = handle();
                let id = format!("session-{}", i % 8);
                let registered = registry.register(&id, h).is_ok();
                (registered, rx)
            }));
        }

        let mut registered = 0;
        let mut receivers = Vec::new();
        for task in tasks {
            let (ok, rx) = task.await.unwrap();
            if ok {
                registered += 1;
            }
            receivers.push(rx);
        }

        assert_eq!(registered, 8);
        assert_eq!(registry.len(), 8);
    }
}
