//! Error types for the Cloud Run MCP server.

use thiserror::Error;

use crate::mcp::protocol::error_codes;

/// Result type alias for Cloud Run MCP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Cloud Run MCP server.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Control Plane Errors =====
    #[error("API error: {status} {status_text} - {message}")]
    Api {
        status: u16,
        status_text: String,
        message: String,
    },

    #[error("Credential resolution failed: {0}")]
    CredentialResolution(String),

    #[error("Permission denied: missing {0:?}")]
    PermissionDenied(Vec<String>),

    // ===== Session / Transport Errors =====
    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    #[error("No transport found for sessionId: {0}")]
    SessionNotFound(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Server is already connected to a transport")]
    AlreadyConnected,

    #[error("Capabilities already registered")]
    CapabilitiesAlreadyRegistered,

    // ===== MCP Errors =====
    #[error("MCP protocol error: {0}")]
    McpProtocol(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    // ===== Command Errors =====
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token signing error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Cancelled: operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Create an API error from HTTP response details.
    pub fn api(status: u16, status_text: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            status_text: status_text.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retriable (transient failures).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || (*status >= 500 && *status < 600),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// JSON-RPC error code reported to the client for this error.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::InvalidToolArguments(_) | Self::ToolNotFound(_) => {
                error_codes::INVALID_PARAMS
            }
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}
