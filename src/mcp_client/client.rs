//! MCP Client: one transport bound to one registry entry.
//!
//! Connects and handshakes with a registered server, publishes its tool list
//! and process id into the [`ServerRegistry`], and exposes a simplified
//! tool call that maps protocol responses into [`ToolCallResult`]s.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::lifecycle::format_stderr_suffix;
use super::registry::{ServerRegistry, ServerStatus, StateUpdate};
use super::transport::{StdioTransport, TransportOptions};
use super::types::{
    CallMetadata, ConnectionState, Implementation, JsonRpcMessage, McpTool, ToolCallResult,
    ToolContent,
};

/// Identity announced to every server during the handshake.
pub fn client_info() -> Implementation {
    Implementation {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Client for a single registered server.
pub struct McpClient {
    server_id: String,
    registry: Arc<ServerRegistry>,
    options: TransportOptions,
    transport: Option<StdioTransport>,
    /// Tool list from the last successful listing.
    tools: RwLock<Vec<McpTool>>,
    /// Marks the registry entry failed if the process dies on its own.
    exit_watch: Option<JoinHandle<()>>,
}

impl McpClient {
    /// Create an unconnected client for `server_id`.
    pub fn new(server_id: &str, registry: Arc<ServerRegistry>, options: TransportOptions) -> Self {
        Self {
            server_id: server_id.to_string(),
            registry,
            options,
            transport: None,
            tools: RwLock::new(Vec::new()),
            exit_watch: None,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn, handshake and list tools, publishing the result to the registry.
    ///
    /// Any failure is recorded in the registry (status `error`) and returned.
    pub async fn connect(&mut self) -> Result<(), McpError> {
        let state = self
            .registry
            .get(&self.server_id)
            .ok_or_else(|| McpError::ServerNotFound {
                id: self.server_id.clone(),
            })?;

        self.stop_exit_watch();
        if let Some(old) = self.transport.take() {
            old.disconnect().await;
        }

        self.registry
            .set_status(&self.server_id, ServerStatus::Starting)?;

        let transport = StdioTransport::new(state.config, self.options);
        match self.establish(&transport).await {
            Ok(tools) => {
                let count = tools.len();
                self.registry.update_state(
                    &self.server_id,
                    StateUpdate::status(ServerStatus::Running)
                        .with_pid(transport.process_id())
                        .with_tools(tools.clone()),
                )?;
                *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools;
                self.exit_watch = transport
                    .process_id()
                    .map(|pid| self.spawn_exit_watch(&transport, pid));
                self.transport = Some(transport);
                tracing::info!(server = %self.server_id, tools = count, "client connected");
                Ok(())
            }
            Err(e) => {
                transport.disconnect().await;
                if let Err(record_err) = self.registry.set_error(&self.server_id, &e.to_string()) {
                    tracing::warn!(server = %self.server_id, error = %record_err, "could not record connect failure");
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, transport: &StdioTransport) -> Result<Vec<McpTool>, McpError> {
        transport.connect().await?;

        if let Err(e) = transport.initialize(client_info()).await {
            let suffix = format_stderr_suffix(&transport.recent_stderr());
            return Err(McpError::InitFailed {
                server: self.server_id.clone(),
                reason: format!("{e}{suffix}"),
            });
        }

        transport.list_tools().await
    }

    fn spawn_exit_watch(&self, transport: &StdioTransport, pid: u32) -> JoinHandle<()> {
        let mut lost = transport.connection_lost();
        let registry = Arc::clone(&self.registry);
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            // Err means the transport was dropped without losing the process.
            if lost.wait_for(Option::is_some).await.is_err() {
                return;
            }
            let reason = lost.borrow().clone().unwrap_or_default();
            registry.mark_exited(&server_id, pid, &reason);
        })
    }

    fn stop_exit_watch(&mut self) {
        if let Some(watch) = self.exit_watch.take() {
            watch.abort();
        }
    }

    /// Tear down the transport; marks the server `stopped` if still registered.
    pub async fn disconnect(&mut self) {
        self.stop_exit_watch();
        if let Some(transport) = self.transport.take() {
            if self.registry.contains(&self.server_id) {
                let _ = self
                    .registry
                    .set_status(&self.server_id, ServerStatus::Stopping);
            }
            transport.disconnect().await;
        }
        if self.registry.contains(&self.server_id) {
            let _ = self
                .registry
                .set_status(&self.server_id, ServerStatus::Stopped);
        }
        tracing::info!(server = %self.server_id, "client disconnected");
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Cached tool list from the last listing.
    pub fn tools(&self) -> Vec<McpTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-list tools and replace both the cache and the registry entry.
    pub async fn refresh_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let transport = self.live_transport()?;
        let tools = transport.list_tools().await?;
        self.registry.update_tools(&self.server_id, tools.clone())?;
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools.clone();
        Ok(tools)
    }

    /// Call a tool and map the response into a uniform result.
    ///
    /// A JSON-RPC error response becomes a failed result rather than an
    /// `Err`; transport failures (timeout, crash) are returned as errors.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let transport = self.live_transport()?;

        let known = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t.name == name);
        if !known {
            return Err(McpError::UnknownTool {
                server: self.server_id.clone(),
                name: name.to_string(),
            });
        }

        let start = Instant::now();
        let outcome = transport.call_tool(name, arguments.clone()).await;
        let metadata = CallMetadata {
            tool_name: name.to_string(),
            arguments,
            timestamp: Utc::now(),
            execution_time_ms: start.elapsed().as_millis() as u64,
        };

        match outcome {
            Ok(result) => {
                let error = result.is_error.then(|| {
                    let text = result.text();
                    if text.is_empty() {
                        "tool reported an error".to_string()
                    } else {
                        text
                    }
                });
                Ok(ToolCallResult {
                    success: !result.is_error,
                    content: result.content,
                    error,
                    metadata,
                })
            }
            Err(McpError::ServerError { code, message, .. }) => Ok(ToolCallResult {
                success: false,
                content: vec![ToolContent::text(message.clone())],
                error: Some(format!("[{code}] {message}")),
                metadata,
            }),
            Err(e) => Err(e),
        }
    }

    fn live_transport(&self) -> Result<&StdioTransport, McpError> {
        self.transport
            .as_ref()
            .filter(|t| t.is_connected())
            .ok_or_else(|| McpError::NotConnected {
                server: self.server_id.clone(),
            })
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_initialized())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map(|t| t.connection_state())
            .unwrap_or_default()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.transport.as_ref().and_then(|t| t.process_id())
    }

    /// Observe server notifications; `None` before the first connect.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<JsonRpcMessage>> {
        self.transport.as_ref().map(|t| t.subscribe())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::ServerConfig;

    fn registry_with(config: ServerConfig) -> Arc<ServerRegistry> {
        let registry = Arc::new(ServerRegistry::new());
        registry.register(config).unwrap();
        registry
    }

    #[test]
    fn test_client_info_uses_crate_identity() {
        let info = client_info();
        assert_eq!(info.name, "toolhost");
        assert!(!info.version.is_empty());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let registry = registry_with(ServerConfig::new("fs", "node"));
        let client = McpClient::new("fs", registry, TransportOptions::default());
        assert!(!client.is_connected());
        assert!(!client.is_initialized());
        assert_eq!(client.connection_state(), ConnectionState::default());
        assert!(client.tools().is_empty());
        assert!(client.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_registration() {
        let registry = Arc::new(ServerRegistry::new());
        let mut client = McpClient::new("missing", registry, TransportOptions::default());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let registry = registry_with(ServerConfig::new("ghost", "/definitely/not/a/real/binary"));
        let mut client = McpClient::new("ghost", Arc::clone(&registry), TransportOptions::default());

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));

        let state = registry.get("ghost").unwrap();
        assert_eq!(state.status, ServerStatus::Error);
        assert!(state.last_error.unwrap().contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_failure_includes_stderr() {
        let config = ServerConfig::new("broken", "sh")
            .with_args(["-c", "echo 'fatal: no config' >&2; read line; exit 1"]);
        let registry = registry_with(config);
        let mut client = McpClient::new("broken", Arc::clone(&registry), TransportOptions::default());

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }), "got {err}");
        assert_eq!(registry.get("broken").unwrap().status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_call_tool_requires_connection() {
        let registry = registry_with(ServerConfig::new("fs", "node"));
        let client = McpClient::new("fs", registry, TransportOptions::default());
        let err = client
            .call_tool("read", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_marks_stopped() {
        let registry = registry_with(ServerConfig::new("fs", "node"));
        registry.set_status("fs", ServerStatus::Error).unwrap();
        let mut client = McpClient::new("fs", Arc::clone(&registry), TransportOptions::default());
        client.disconnect().await;
        assert_eq!(registry.get("fs").unwrap().status, ServerStatus::Stopped);
    }
}
