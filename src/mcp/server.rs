//! MCP server implementation.
//!
//! One [`McpServer`] is built per protocol negotiation: per request on the
//! stateless endpoint, per connection on the streaming endpoint. It binds to
//! exactly one transport for its whole life.

use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{CapabilityContext, CapabilityResolution, CapabilitySource, SourceKind};
use crate::error::{Error, Result};
use crate::mcp::handler::{error_result, ToolRegistry};
use crate::mcp::prompts::{ListPromptsResult, PromptRegistry};
use crate::mcp::protocol::*;
use crate::mcp::transport::Transport;
use crate::metrics::{self, Timer};
use crate::tools;

/// Log level reported before any `logging/setLevel`.
const DEFAULT_LOG_LEVEL: &str = "info";

/// MCP server.
pub struct McpServer {
    info: ServerInfo,
    tools: RwLock<ToolRegistry>,
    prompts: RwLock<PromptRegistry>,
    profile: OnceLock<(CapabilityContext, SourceKind)>,
    log_level: RwLock<String>,
    connected: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl McpServer {
    /// Create a server with the built-in prompts and no tools.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: ServerInfo {
                name: name.into(),
                version: version.into(),
            },
            tools: RwLock::new(ToolRegistry::new()),
            prompts: RwLock::new(PromptRegistry::new()),
            profile: OnceLock::new(),
            log_level: RwLock::new(DEFAULT_LOG_LEVEL.to_string()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Install the tool set picked by the resolver. Allowed once.
    pub async fn register_capabilities(&self, resolution: CapabilityResolution) -> Result<()> {
        let CapabilityResolution { context, source } = resolution;
        let kind = source.kind();

        self.profile
            .set((context.clone(), kind))
            .map_err(|_| Error::CapabilitiesAlreadyRegistered)?;

        let mut registry = self.tools.write().await;
        match source {
            CapabilitySource::Local(local) => tools::register_local_tools(&mut registry, context, local),
            CapabilitySource::Remote(remote) => tools::register_remote_tools(&mut registry, context, remote),
        }

        info!(
            "Registered {} {} tools for {}",
            registry.tool_count(),
            kind,
            self.info.name
        );
        Ok(())
    }

    /// Capability context installed by [`register_capabilities`](Self::register_capabilities).
    pub fn capability_context(&self) -> Option<&CapabilityContext> {
        self.profile.get().map(|(context, _)| context)
    }

    /// Which tool set is installed, if any.
    pub fn capability_source(&self) -> Option<SourceKind> {
        self.profile.get().map(|(_, kind)| *kind)
    }

    /// Level most recently requested with `logging/setLevel`.
    pub async fn log_level(&self) -> String {
        self.log_level.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bind to `transport` and drain its messages until it closes.
    pub async fn connect(&self, transport: &mut dyn Transport) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }

        let session = transport.session_id().map(String::from);
        debug!(
            "Connecting {} v{} (session: {:?})",
            self.info.name, self.info.version, session
        );

        let (mut incoming, outgoing) = transport.start().await?;
        let transport_closed = transport.closed();

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = transport_closed.cancelled() => break,
                message = incoming.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                JsonRpcMessage::Request(req) => {
                    // Disconnect abandons the in-flight call.
                    let response = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = transport_closed.cancelled() => break,
                        response = self.handle_request_contained(req) => response,
                    };
                    if outgoing.send(JsonRpcMessage::Response(response)).await.is_err() {
                        error!("Failed to send response");
                        break;
                    }
                }
                JsonRpcMessage::Invalid(rejection) => {
                    if outgoing.send(JsonRpcMessage::Response(rejection)).await.is_err() {
                        error!("Failed to send response");
                        break;
                    }
                }
                JsonRpcMessage::Notification(notif) => self.handle_notification(notif),
                JsonRpcMessage::Response(_) => warn!("Received unexpected response"),
            }
        }

        debug!("Disconnected {} (session: {:?})", self.info.name, session);
        Ok(())
    }

    /// Release the registries and stop any running `connect`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.tools.write().await.clear();
        self.prompts.write().await.clear();
        debug!("Closed {}", self.info.name);
    }

    /// Handle one request; panics become internal errors.
    async fn handle_request_contained(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let id = req.id.clone();
        match AssertUnwindSafe(self.handle_request(req)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!("Request {:?} panicked", id);
                JsonRpcResponse::failure(Some(id), error_codes::INTERNAL_ERROR, "Internal error")
            }
        }
    }

    /// Handle a JSON-RPC request.
    async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Handling request: {} (id: {:?})", req.method, req.id);

        let result = match req.method.as_str() {
            "initialize" => self.handle_initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_list_tools().await,
            "tools/call" => self.handle_call_tool(req.params).await,
            "prompts/list" => self.handle_list_prompts().await,
            "prompts/get" => self.handle_get_prompt(req.params).await,
            "logging/setLevel" => self.handle_set_level(req.params).await,
            _ => Err(Error::MethodNotFound(req.method.clone())),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(req.id, value),
            Err(e) => {
                debug!("Request {} failed: {}", req.method, e);
                JsonRpcResponse::failure(Some(req.id), e.rpc_code(), e.to_string())
            }
        }
    }

    fn handle_notification(&self, notif: JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => info!("Client initialized"),
            "notifications/cancelled" => debug!("Client cancelled a request: {:?}", notif.params),
            _ => debug!("Unknown notification: {}", notif.method),
        }
    }

    fn handle_initialize(&self) -> Result<Value> {
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                prompts: Some(PromptsCapability::default()),
                logging: Some(LoggingCapability {}),
            },
            server_info: self.info.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_list_tools(&self) -> Result<Value> {
        let tools = self.tools.read().await.list_tools();
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params: CallToolParams = parse_params(params)?;

        let handler = self
            .tools
            .read()
            .await
            .get_tool(&params.name)
            .ok_or_else(|| Error::ToolNotFound(params.name.clone()))?;

        let timer = Timer::start();
        let result = match handler.execute(params.arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Tool {} failed: {}", params.name, e);
                error_result(e.to_string())
            }
        };
        metrics::tool_call(&params.name, result.is_error, &timer);
        debug!("Tool {} finished in {}ms", params.name, timer.elapsed_ms());

        Ok(serde_json::to_value(result)?)
    }

    async fn handle_list_prompts(&self) -> Result<Value> {
        let prompts = self.prompts.read().await.list();
        Ok(serde_json::to_value(ListPromptsResult {
            prompts,
            next_cursor: None,
        })?)
    }

    async fn handle_get_prompt(&self, params: Option<Value>) -> Result<Value> {
        #[derive(serde::Deserialize)]
        struct GetPromptParams {
            name: String,
            #[serde(default)]
            arguments: HashMap<String, String>,
        }

        let params: GetPromptParams = parse_params(params)?;
        let result = self.prompts.read().await.get(&params.name, &params.arguments)?;
        Ok(serde_json::to_value(result)?)
    }

    /// Any level is accepted and stored as given.
    async fn handle_set_level(&self, params: Option<Value>) -> Result<Value> {
        let level = params
            .and_then(|v| serde_json::from_value::<SetLevelParams>(v).ok())
            .map(|p| p.level)
            .unwrap_or_default();

        info!("Setting log level to: {}", level);
        *self.log_level.write().await = level;
        Ok(json!({}))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::InvalidParams("Missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

#[cfg(test)]
impl McpServer {
    pub(crate) async fn insert_tool<T: crate::mcp::handler::ToolHandler + 'static>(&self, tool: T) {
        self.tools.write().await.register(tool);
    }
}
