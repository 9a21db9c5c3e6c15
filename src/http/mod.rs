//! HTTP front end.
//!
//! Builds a fresh [`McpServer`] per stateless request (`POST /mcp`) and per
//! streaming connection (`GET /sse`). Messages posted to
//! `/messages?sessionId=` are routed through the [`SessionRegistry`] to the
//! server already bound to that session.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::capabilities::CapabilityResolver;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gcp::{AdcProbe, AllowedCommand, GcloudRunner, MetadataClient};
use crate::mcp::protocol::{error_codes, IncomingPayload, JsonRpcResponse};
use crate::mcp::server::McpServer;
use crate::mcp::session::SessionRegistry;
use crate::mcp::transport::{RequestTransport, StreamingTransport, Transport};
use crate::metrics;
use crate::{SERVER_NAME, VERSION};

/// Body of a 400 for a post to an unknown session.
pub const NO_TRANSPORT: &str = "No transport found for sessionId";

/// Shared state of the front end.
#[derive(Clone)]
pub struct AppState {
    resolver: Arc<CapabilityResolver>,
    sessions: Arc<SessionRegistry>,
    enable_command_endpoint: bool,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(resolver: Arc<CapabilityResolver>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            resolver,
            sessions,
            enable_command_endpoint: false,
            metrics: None,
        }
    }

    /// Serve `POST /ask`.
    pub fn with_command_endpoint(mut self, enabled: bool) -> Self {
        self.enable_command_endpoint = enabled;
        self
    }

    /// Serve `GET /metrics` from `handle`.
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

/// Build the router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_message))
        .route("/health", get(health_check));

    if state.enable_command_endpoint {
        router = router.route("/ask", post(handle_ask));
    }
    if state.metrics.is_some() {
        router = router.route("/metrics", get(render_metrics));
    }

    router
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(config: &Config) -> Result<()> {
    let resolver = CapabilityResolver::new(
        config.cloud_defaults(),
        Arc::new(AdcProbe::new()?),
        Arc::new(MetadataClient::new()?),
    )
    .with_gcloud(GcloudRunner::new(&config.gcloud_path));

    let metrics = if config.metrics {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let state = AppState::new(Arc::new(resolver), Arc::new(SessionRegistry::new()))
        .with_command_endpoint(config.enable_command_endpoint)
        .with_metrics(metrics);

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Cloud Run MCP server listening on port {}", config.port);
    if config.enable_command_endpoint {
        warn!("POST /ask is enabled");
    }

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Resolve capabilities and build a server bound to them.
async fn build_server(resolver: &CapabilityResolver) -> Result<McpServer> {
    let server = McpServer::new(SERVER_NAME, VERSION);
    server.register_capabilities(resolver.resolve().await).await?;
    Ok(server)
}

// ===== Stateless endpoint =====

async fn handle_mcp(State(state): State<AppState>, body: Bytes) -> Response {
    metrics::stateless_request();

    let payload = match IncomingPayload::parse(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Rejected MCP request: {}", e);
            let (code, message) = match e {
                Error::Json(_) => (error_codes::PARSE_ERROR, "Parse error"),
                _ => (error_codes::INVALID_REQUEST, "Invalid Request"),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::failure(None, code, message)),
            )
                .into_response();
        }
    };
    let batch = payload.is_batch();

    let result = match build_server(&state.resolver).await {
        Ok(server) => serve_stateless(&server, &mut RequestTransport::new(), payload).await,
        Err(e) => Err(e),
    };
    stateless_response(batch, result)
}

/// One request/response cycle; server and transport are closed on every path.
async fn serve_stateless(
    server: &McpServer,
    transport: &mut RequestTransport,
    payload: IncomingPayload,
) -> Result<Vec<JsonRpcResponse>> {
    let result = async {
        transport.receive(payload)?;
        server.connect(transport).await?;
        transport.respond()
    }
    .await;

    let closed = transport.close().await;
    server.close().await;

    let responses = result?;
    closed?;
    Ok(responses)
}

/// Shape the HTTP reply of a stateless cycle.
fn stateless_response(batch: bool, result: Result<Vec<JsonRpcResponse>>) -> Response {
    match result {
        Ok(responses) if responses.is_empty() => StatusCode::ACCEPTED.into_response(),
        Ok(mut responses) if !batch => Json(responses.swap_remove(0)).into_response(),
        Ok(responses) => Json(responses).into_response(),
        Err(e) => {
            error!("Error handling MCP request: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(JsonRpcResponse::internal_server_error()),
            )
                .into_response()
        }
    }
}

// ===== Streaming endpoint =====

async fn handle_sse(State(state): State<AppState>) -> Response {
    let server = match build_server(&state.resolver).await {
        Ok(server) => server,
        Err(e) => {
            error!("Error building server for SSE connection: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (mut transport, events) = match StreamingTransport::open(state.sessions.clone()) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Error opening SSE session: {}", e);
            server.close().await;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let session_id = transport.id().to_string();
    info!("New SSE connection, session {}", session_id);

    tokio::spawn(async move {
        if let Err(e) = server.connect(&mut transport).await {
            warn!("Session {} ended with error: {}", session_id, e);
        }
        if let Err(e) = transport.close().await {
            warn!("Error closing session {}: {}", session_id, e);
        }
        server.close().await;
        info!("SSE connection closed, session {}", session_id);
    });

    let stream = events.map(|event| {
        Ok::<_, Infallible>(Event::default().event(event.name()).data(event.data()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn handle_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let handle = match query.session_id.as_deref().map(|id| state.sessions.lookup(id)) {
        Some(Ok(handle)) => handle,
        _ => return (StatusCode::BAD_REQUEST, NO_TRANSPORT).into_response(),
    };

    let payload = match IncomingPayload::parse(&body) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid message: {}", e)).into_response(),
    };

    for message in payload.into_messages() {
        if let Err(e) = handle.post(message).await {
            warn!("Dropping message for session {:?}: {}", query.session_id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        metrics::message_posted();
    }

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

// ===== Auxiliary endpoints =====

#[derive(Debug, Deserialize)]
struct AskRequest {
    input: String,
}

/// Run an allow-listed read-only gcloud command.
async fn handle_ask(State(state): State<AppState>, Json(request): Json<AskRequest>) -> Response {
    let command = match AllowedCommand::parse(&request.input) {
        Ok(command) => command,
        Err(e) => {
            warn!("Rejected command: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    match state.resolver.gcloud().run(command.args()).await {
        Ok(output) => Json(json!({
            "raw": output.stdout,
            "parsed": output.parsed(),
        }))
        .into_response(),
        Err(e) => {
            error!("Command execution failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Execution failed" })),
            )
                .into_response()
        }
    }
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "activeSessions": state.sessions.len(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
