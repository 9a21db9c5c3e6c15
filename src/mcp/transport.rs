//! MCP transport layer implementations.
//!
//! Two variants share the [`Transport`] trait:
//!
//! - [`RequestTransport`] - one HTTP request/response cycle, no session id
//! - [`StreamingTransport`] - a server-sent-events channel plus messages
//!   posted out of band and routed through the [`SessionRegistry`]

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::protocol::{IncomingPayload, JsonRpcMessage, JsonRpcResponse};
use crate::mcp::session::{SessionRegistry, StreamingHandle};

/// Capacity of the per-session message channels.
const CHANNEL_CAPACITY: usize = 100;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send {
    /// Start the transport, returning channels for messages.
    async fn start(&mut self) -> Result<(mpsc::Receiver<JsonRpcMessage>, mpsc::Sender<JsonRpcMessage>)>;

    /// Close the transport. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;

    /// Session id, for transports that have one.
    fn session_id(&self) -> Option<&str> {
        None
    }

    /// Fires when the underlying channel goes away.
    fn closed(&self) -> CancellationToken;
}

// ===== Request/response =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Receiving,
    Dispatching,
    Responding,
    Closed,
}

/// Stateless transport bound to a single request/response pair.
pub struct RequestTransport {
    state: RequestState,
    pending: Vec<JsonRpcMessage>,
    responses: Option<mpsc::Receiver<JsonRpcMessage>>,
    cancel: CancellationToken,
}

impl Default for RequestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTransport {
    pub fn new() -> Self {
        Self {
            state: RequestState::Idle,
            pending: Vec::new(),
            responses: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Accept the request body. Only one payload per transport.
    pub fn receive(&mut self, payload: IncomingPayload) -> Result<()> {
        match self.state {
            RequestState::Idle => {
                self.pending = payload.into_messages();
                self.state = RequestState::Receiving;
                Ok(())
            }
            RequestState::Closed => Err(Error::TransportClosed),
            state => Err(Error::McpProtocol(format!(
                "request transport cannot receive while {:?}",
                state
            ))),
        }
    }

    /// Collect the responses written by the server, in request order.
    pub fn respond(&mut self) -> Result<Vec<JsonRpcResponse>> {
        match self.state {
            RequestState::Dispatching => {}
            RequestState::Closed => return Err(Error::TransportClosed),
            state => {
                return Err(Error::McpProtocol(format!(
                    "request transport cannot respond while {:?}",
                    state
                )))
            }
        }
        self.state = RequestState::Responding;

        let mut responses = Vec::new();
        if let Some(rx) = self.responses.as_mut() {
            while let Ok(message) = rx.try_recv() {
                if let JsonRpcMessage::Response(response) = message {
                    responses.push(response);
                }
            }
        }
        Ok(responses)
    }
}

#[async_trait]
impl Transport for RequestTransport {
    async fn start(&mut self) -> Result<(mpsc::Receiver<JsonRpcMessage>, mpsc::Sender<JsonRpcMessage>)> {
        match self.state {
            RequestState::Receiving => {}
            RequestState::Closed => return Err(Error::TransportClosed),
            state => {
                return Err(Error::McpProtocol(format!(
                    "request transport cannot start while {:?}",
                    state
                )))
            }
        }

        let messages = std::mem::take(&mut self.pending);
        let requests = messages.iter().filter(|m| m.is_request()).count();

        let (incoming_tx, incoming_rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            incoming_tx
                .try_send(message)
                .map_err(|_| Error::Internal("request channel full".to_string()))?;
        }
        // Dropping the sender ends the server loop once the payload is drained.
        drop(incoming_tx);

        // Sized so the server never waits on a reader that only runs afterwards.
        let (outgoing_tx, outgoing_rx) = mpsc::channel(requests.max(1));
        self.responses = Some(outgoing_rx);
        self.state = RequestState::Dispatching;

        Ok((incoming_rx, outgoing_tx))
    }

    async fn close(&mut self) -> Result<()> {
        if self.state != RequestState::Closed {
            self.state = RequestState::Closed;
            self.pending.clear();
            self.responses = None;
            self.cancel.cancel();
        }
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ===== Streaming =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Active,
    Closing,
    Closed,
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Where the client should post its messages.
    Endpoint(String),
    /// A serialised JSON-RPC message.
    Message(String),
}

impl StreamEvent {
    /// SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Endpoint(_) => "endpoint",
            Self::Message(_) => "message",
        }
    }

    /// SSE `data:` field.
    pub fn data(&self) -> &str {
        match self {
            Self::Endpoint(data) | Self::Message(data) => data,
        }
    }
}

/// Releases the session when the response body is dropped.
struct SessionGuard {
    id: String,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!("Event stream for session {} dropped", self.id);
        self.cancel.cancel();
        self.registry.deregister(&self.id);
    }
}

/// Events to write on the streaming response.
pub struct EventStream {
    inner: ReceiverStream<StreamEvent>,
    _guard: SessionGuard,
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Server-push transport with a side channel for posted messages.
pub struct StreamingTransport {
    id: String,
    state: StreamState,
    registry: Arc<SessionRegistry>,
    incoming: Option<mpsc::Receiver<JsonRpcMessage>>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamingTransport {
    /// Open a session: assign a fresh id, register it and queue the endpoint event.
    pub fn open(registry: Arc<SessionRegistry>) -> Result<(Self, EventStream)> {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);

        registry.register(&id, StreamingHandle::new(incoming_tx, cancel.clone()))?;

        events_tx
            .try_send(StreamEvent::Endpoint(format!("/messages?sessionId={}", id)))
            .map_err(|_| Error::TransportClosed)?;

        let stream = EventStream {
            inner: ReceiverStream::new(events_rx),
            _guard: SessionGuard {
                id: id.clone(),
                registry: registry.clone(),
                cancel: cancel.clone(),
            },
        };

        info!("Opened streaming session {}", id);

        let transport = Self {
            id,
            state: StreamState::Open,
            registry,
            incoming: Some(incoming_rx),
            events: events_tx,
            cancel,
        };
        Ok((transport, stream))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    async fn start(&mut self) -> Result<(mpsc::Receiver<JsonRpcMessage>, mpsc::Sender<JsonRpcMessage>)> {
        if self.state != StreamState::Open || self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let incoming = self.incoming.take().ok_or(Error::TransportClosed)?;
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outgoing_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let data = match serde_json::to_string(&message) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Error serializing message for session {}: {}", id, e);
                        continue;
                    }
                };
                trace!("Sending on session {}: {}", id, data);

                if events.send(StreamEvent::Message(data)).await.is_err() {
                    debug!("Event stream for session {} is gone", id);
                    cancel.cancel();
                    break;
                }
            }
        });

        self.state = StreamState::Active;
        Ok((incoming, outgoing_tx))
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.state = StreamState::Closing;
        self.registry.deregister(&self.id);
        self.cancel.cancel();
        self.incoming = None;
        self.state = StreamState::Closed;
        info!("Closed streaming session {}", self.id);
        Ok(())
    }

    fn session_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcRequest, RequestId, JSONRPC_VERSION};
    use futures::StreamExt;
    use serde_json::json;

    fn ping(id: i64) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Number(id),
            method: "ping".to_string(),
            params: None,
        })
    }

    #[tokio::test]
    async fn test_request_transport_single_cycle() {
        let mut transport = RequestTransport::new();
        assert_eq!(transport.session_id(), None);

        transport
            .receive(IncomingPayload::Batch(vec![ping(1), ping(2)]))
            .unwrap();
        let (mut incoming, outgoing) = transport.start().await.unwrap();
        assert_eq!(transport.state(), RequestState::Dispatching);

        while let Some(message) = incoming.recv().await {
            if let JsonRpcMessage::Request(req) = message {
                outgoing
                    .send(JsonRpcMessage::Response(JsonRpcResponse::success(req.id, json!({}))))
                    .await
                    .unwrap();
            }
        }
        drop(outgoing);

        let responses = transport.respond().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Some(RequestId::Number(1)));
        assert_eq!(responses[1].id, Some(RequestId::Number(2)));
    }

    #[tokio::test]
    async fn test_request_transport_rejects_reuse() {
        let mut transport = RequestTransport::new();
        transport.receive(IncomingPayload::Single(ping(1))).unwrap();
        assert!(transport.receive(IncomingPayload::Single(ping(2))).is_err());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), RequestState::Closed);
        assert!(transport.closed().is_cancelled());

        assert!(matches!(
            transport.receive(IncomingPayload::Single(ping(3))),
            Err(Error::TransportClosed)
        ));
        assert!(matches!(transport.start().await, Err(Error::TransportClosed)));
        assert!(matches!(transport.respond(), Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_streaming_open_registers_and_announces_endpoint() {
        let registry = Arc::new(SessionRegistry::new());
        let (transport, mut events) = StreamingTransport::open(registry.clone()).unwrap();

        assert!(registry.contains(transport.id()));
        assert_eq!(transport.session_id(), Some(transport.id()));
        assert_eq!(transport.state(), StreamState::Open);

        let first = events.next().await.unwrap();
        assert_eq!(first.name(), "endpoint");
        assert_eq!(first.data(), format!("/messages?sessionId={}", transport.id()));
    }

    #[tokio::test]
    async fn test_streaming_routes_posts_and_pushes_responses() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut transport, mut events) = StreamingTransport::open(registry.clone()).unwrap();
        let _ = events.next().await;

        let (mut incoming, outgoing) = transport.start().await.unwrap();
        assert_eq!(transport.state(), StreamState::Active);

        registry.lookup(transport.id()).unwrap().post(ping(7)).await.unwrap();
        let received = incoming.recv().await.unwrap();
        assert!(received.is_request());

        outgoing
            .send(JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::Number(7),
                json!({}),
            )))
            .await
            .unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.name(), "message");
        let value: serde_json::Value = serde_json::from_str(event.data()).unwrap();
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn test_streaming_close_deregisters_once() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut transport, _events) = StreamingTransport::open(registry.clone()).unwrap();
        let id = transport.id().to_string();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(transport.state(), StreamState::Closed);
        assert!(!registry.contains(&id));
        assert!(transport.closed().is_cancelled());
        assert!(matches!(transport.start().await, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_dropping_event_stream_tears_down_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (transport, events) = StreamingTransport::open(registry.clone()).unwrap();
        let id = transport.id().to_string();
        let closed = transport.closed();

        drop(events);

        assert!(closed.is_cancelled());
        assert!(matches!(registry.lookup(&id), Err(Error::SessionNotFound(_))));
    }
}
