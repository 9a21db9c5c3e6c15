//! Front-end Integration Tests
//!
//! Bind the router on a loopback port and drive the stateless and
//! streaming endpoints with a real HTTP client.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use cloud_run_mcp::capabilities::{CapabilityResolver, CloudDefaults};
use cloud_run_mcp::error::{Error, Result};
use cloud_run_mcp::gcp::{AccessGrant, CredentialProbe, GcloudRunner, NoEnvironment};
use cloud_run_mcp::http::{build_router, AppState, NO_TRANSPORT};
use cloud_run_mcp::mcp::SessionRegistry;

/// Simulates a network failure while probing credentials.
struct UnreachableCredentials;

#[async_trait]
impl CredentialProbe for UnreachableCredentials {
    async fn authenticate(&self) -> Result<AccessGrant> {
        Err(Error::Internal("simulated network failure".to_string()))
    }
}

struct TestServer {
    base: String,
    sessions: Arc<SessionRegistry>,
    client: reqwest::Client,
}

async fn spawn_server() -> TestServer {
    let resolver = CapabilityResolver::new(
        CloudDefaults {
            project_id: Some("demo".to_string()),
            ..Default::default()
        },
        Arc::new(UnreachableCredentials),
        Arc::new(NoEnvironment),
    )
    .with_gcloud(GcloudRunner::new("/nonexistent/gcloud"));

    let sessions = Arc::new(SessionRegistry::new());
    let state = AppState::new(Arc::new(resolver), sessions.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        sessions,
        client: reqwest::Client::new(),
    }
}

/// Minimal server-sent-events reader over a streaming response.
struct SseClient {
    response: reqwest::Response,
    buffer: String,
}

impl SseClient {
    async fn connect(server: &TestServer) -> Self {
        let response = server
            .client
            .get(format!("{}/sse", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        Self {
            response,
            buffer: String::new(),
        }
    }

    /// Next `(event, data)` pair, skipping keep-alive comments.
    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let mut event = String::from("message");
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.trim_start().to_string());
                    }
                }
                if data.is_empty() {
                    continue;
                }
                return Some((event, data.join("\n")));
            }

            let chunk = self.response.chunk().await.ok()??;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    async fn next_event_within(&mut self, timeout: Duration) -> Option<(String, String)> {
        tokio::time::timeout(timeout, self.next_event()).await.ok().flatten()
    }

    /// Read the endpoint event and return the session id.
    async fn session_id(&mut self) -> String {
        let (event, data) = self
            .next_event_within(Duration::from_secs(5))
            .await
            .expect("no endpoint event");
        assert_eq!(event, "endpoint");
        data.strip_prefix("/messages?sessionId=")
            .expect("unexpected endpoint path")
            .to_string()
    }
}

async fn post_message(server: &TestServer, session_id: &str, body: Value) -> (u16, String) {
    let response = server
        .client
        .post(format!("{}/messages?sessionId={}", server.base, session_id))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn test_stateless_initialize() {
    let server = spawn_server().await;

    let response = server
        .client
        .post(format!("{}/mcp", server.base))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" }
            }
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(server.sessions.len(), 0);
}

#[tokio::test]
async fn test_stateless_requests_are_independent() {
    let server = spawn_server().await;

    for id in 1..=3 {
        let response = server
            .client
            .post(format!("{}/mcp", server.base))
            .json(&json!({ "jsonrpc": "2.0", "id": id, "method": "tools/list" }))
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["id"], id);
        assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 5);
    }
}

#[tokio::test]
async fn test_sse_tools_list_round_trip() {
    let server = spawn_server().await;
    let mut sse = SseClient::connect(&server).await;
    let session_id = sse.session_id().await;
    assert!(server.sessions.contains(&session_id));

    let (status, body) = post_message(
        &server,
        &session_id,
        json!({ "jsonrpc": "2.0", "id": 7, "method": "tools/list" }),
    )
    .await;
    assert_eq!(status, 202);
    assert_eq!(body, "Accepted");

    let (event, data) = sse
        .next_event_within(Duration::from_secs(5))
        .await
        .expect("no response on the stream");
    assert_eq!(event, "message");
    let message: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(message["id"], 7);
    assert_eq!(message["result"]["tools"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_sse_messages_reach_only_their_session() {
    let server = spawn_server().await;
    let mut first = SseClient::connect(&server).await;
    let mut second = SseClient::connect(&server).await;
    let first_id = first.session_id().await;
    let second_id = second.session_id().await;
    assert_ne!(first_id, second_id);
    assert_eq!(server.sessions.len(), 2);

    let (status, _) = post_message(
        &server,
        &first_id,
        json!({ "jsonrpc": "2.0", "id": "only-first", "method": "ping" }),
    )
    .await;
    assert_eq!(status, 202);

    let (_, data) = first
        .next_event_within(Duration::from_secs(5))
        .await
        .expect("first session got nothing");
    let message: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(message["id"], "only-first");

    assert!(second
        .next_event_within(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn test_post_to_unknown_session() {
    let server = spawn_server().await;
    let (status, body) = post_message(
        &server,
        "does-not-exist",
        json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }),
    )
    .await;

    assert_eq!(status, 400);
    assert_eq!(body, NO_TRANSPORT);
}

#[tokio::test]
async fn test_post_invalid_body_to_live_session() {
    let server = spawn_server().await;
    let mut sse = SseClient::connect(&server).await;
    let session_id = sse.session_id().await;

    let (status, _) = post_message(&server, &session_id, json!({ "hello": "world" })).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_session_removed_after_disconnect() {
    let server = spawn_server().await;
    let mut sse = SseClient::connect(&server).await;
    let session_id = sse.session_id().await;
    drop(sse);

    let mut removed = false;
    for _ in 0..300 {
        if !server.sessions.contains(&session_id) {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(removed, "session {} still registered", session_id);

    let (status, body) = post_message(
        &server,
        &session_id,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body, NO_TRANSPORT);
}

#[tokio::test]
async fn test_failing_session_does_not_affect_others() {
    let server = spawn_server().await;
    let mut healthy = SseClient::connect(&server).await;
    let healthy_id = healthy.session_id().await;

    let mut failing = SseClient::connect(&server).await;
    let failing_id = failing.session_id().await;
    let (status, _) = post_message(
        &server,
        &failing_id,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "missing" } }),
    )
    .await;
    assert_eq!(status, 202);
    let (_, data) = failing
        .next_event_within(Duration::from_secs(5))
        .await
        .unwrap();
    let error: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(error["error"]["code"], -32602);
    drop(failing);

    let (status, _) = post_message(
        &server,
        &healthy_id,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
    )
    .await;
    assert_eq!(status, 202);
    let (_, data) = healthy
        .next_event_within(Duration::from_secs(5))
        .await
        .unwrap();
    let pong: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(pong["id"], 2);
}
