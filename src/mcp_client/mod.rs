//! MCP Client: JSON-RPC over stdio transport for MCP server management.
//!
//! This module handles:
//! - Spawning and terminating MCP server child processes
//! - JSON-RPC 2.0 framing and request correlation over process stdio
//! - The server registry and its lifecycle state machine
//! - Tool discovery, capability tagging and usage statistics
//!
//! Tool execution policy (validation, retries, result shaping) lives in
//! [`crate::execution`] and sits on top of this module.

pub mod client;
pub mod discovery;
pub mod errors;
pub mod framing;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use discovery::{DiscoveredTool, DiscoveryOptions, DiscoveryReport, ToolDiscovery};
pub use errors::McpError;
pub use pool::ClientPool;
pub use registry::{RegistryStatistics, ServerRegistry, ServerState, ServerStatus, StateUpdate};
pub use transport::{StdioTransport, TransportOptions};
pub use types::{
    CallToolResult, ConnectionState, JsonRpcMessage, McpTool, ServerConfig, ToolCallResult,
    ToolContent, ToolInputSchema,
};
