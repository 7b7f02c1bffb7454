//! toolhost: discover, invoke and supervise MCP tool servers over stdio.
//!
//! - [`mcp_client`]: process lifecycle, JSON-RPC transport, server registry,
//!   clients and tool discovery
//! - [`execution`]: validated, transformed, timed and retried tool calls,
//!   plus result normalization and error classification
//! - [`config`] and [`logging`]: runtime configuration and tracing setup
//!
//! Components share one [`ServerRegistry`] passed in at construction:
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolhost::{ServerConfig, ServerRegistry, ToolExecutor, ExecutionContext};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ServerRegistry::new());
//! registry.register(ServerConfig::new("echo", "mcp-echo-server"))?;
//!
//! let executor = ToolExecutor::new(Arc::clone(&registry), Default::default(), Default::default());
//! let outcome = executor
//!     .execute_tool("echo", "echo", serde_json::json!({"message": "hi"}), &ExecutionContext::new())
//!     .await?;
//! println!("{}", outcome.result.text());
//! executor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod execution;
pub mod logging;
pub mod mcp_client;

pub use config::{load_config, RuntimeConfig};
pub use execution::{
    ExecutionContext, ExecutionError, ExecutionOutcome, ExecutorOptions, HandlerOptions,
    ResultHandler, ToolExecutor,
};
pub use mcp_client::{
    McpClient, McpError, ServerConfig, ServerRegistry, ServerStatus, ToolDiscovery,
};
