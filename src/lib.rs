//! Cloud Run MCP Server
//!
//! A Model Context Protocol (MCP) server that deploys and inspects Google
//! Cloud Run services. Clients talk to it over a stateless request/response
//! endpoint (`POST /mcp`) or the legacy server-sent-events pair
//! (`GET /sse` plus `POST /messages`).
//!
//! # Architecture
//!
//! 1. **Capabilities** (`capabilities`) - per-server choice between local and remote tools
//! 2. **Google Cloud** (`gcp`) - credentials, metadata server, REST client, gcloud runner
//! 3. **MCP Layer** (`mcp`) - protocol server, transports, session registry
//! 4. **Tools Layer** (`tools`) - Cloud Run tools over a local or remote backend
//! 5. **Front end** (`http`) - axum router wiring requests to fresh servers

pub mod capabilities;
pub mod config;
pub mod error;
pub mod gcp;
pub mod http;
pub mod mcp;
pub mod metrics;
pub mod tools;

pub use error::{Error, Result};

/// Server version reported in `initialize` and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name reported in `initialize`.
pub const SERVER_NAME: &str = "cloud-run";
