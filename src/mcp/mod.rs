//! Model Context Protocol (MCP) implementation.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC and MCP message types
//! - `handler` - tool registry
//! - `prompts` - prompt registry
//! - `server` - protocol server, one per negotiation
//! - `transport` - stateless request and streaming transports
//! - `session` - registry of live streaming sessions

pub mod handler;
pub mod prompts;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use handler::{ToolHandler, ToolRegistry};
pub use protocol::*;
pub use server::McpServer;
pub use session::{SessionRegistry, StreamingHandle};
pub use transport::{EventStream, RequestTransport, StreamEvent, StreamingTransport, Transport};
