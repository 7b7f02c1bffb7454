//! Tool Executor: resilient wrapper around a single tool call.
//!
//! Pipeline per call:
//! 1. Resolve the tool's schema through the registry
//! 2. Validate arguments (hard failure, never retried)
//! 3. Apply suffix-pattern argument transforms
//! 4. Call through a pooled client, raced against a timeout
//! 5. Retry failed calls with a fixed delay, up to `max_retries` extra attempts
//!
//! Tool-reported errors (`isError` or a JSON-RPC error response) are returned
//! as a failed [`ToolCallResult`] and are not retried; only call failures are.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::ExecutionError;
use super::transform::ArgumentTransformer;
use super::validation::validate_arguments;
use crate::mcp_client::{
    ClientPool, McpError, McpTool, ServerRegistry, ServerStatus, ToolCallResult, ToolDiscovery,
    TransportOptions,
};

// ─── Options ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}

/// Executor policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    #[serde(default = "default_true")]
    pub validate_arguments: bool,
    #[serde(default = "default_true")]
    pub transform_arguments: bool,
    /// Budget for one attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            validate_arguments: true,
            transform_arguments: true,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Per-call identity and overrides.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub request_id: String,
    /// Free-form label of whoever asked for the call.
    pub caller: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            caller: None,
            timeout_ms: None,
            max_retries: None,
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = Some(caller.to_string());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A call that completed (successfully or with a tool-reported error).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub request_id: String,
    pub server_id: String,
    pub result: ToolCallResult,
    /// Attempts made, counted from 1.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

// ─── ToolExecutor ────────────────────────────────────────────────────────────

/// Executes tool calls against registered servers.
pub struct ToolExecutor {
    registry: Arc<ServerRegistry>,
    pool: ClientPool,
    options: ExecutorOptions,
    transformer: ArgumentTransformer,
    discovery: Option<Arc<ToolDiscovery>>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        options: ExecutorOptions,
        transport: TransportOptions,
    ) -> Self {
        let pool = ClientPool::new(Arc::clone(&registry), transport);
        Self {
            registry,
            pool,
            options,
            transformer: ArgumentTransformer::default(),
            discovery: None,
        }
    }

    /// Replace the argument transformer.
    pub fn with_transformer(mut self, transformer: ArgumentTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    /// Report every attempt's outcome into `discovery`'s usage statistics.
    pub fn with_discovery(mut self, discovery: Arc<ToolDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Validate, transform and call `tool_name` on `server_id`, retrying
    /// call failures.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        context: &ExecutionContext,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let start = Instant::now();
        let tool = self.resolve_tool(server_id, tool_name).await?;

        if self.options.validate_arguments {
            let errors = validate_arguments(&tool.input_schema, &arguments);
            if !errors.is_empty() {
                tracing::warn!(
                    request_id = %context.request_id,
                    server = server_id,
                    tool = tool_name,
                    errors = errors.len(),
                    "argument validation failed"
                );
                return Err(ExecutionError::InvalidArguments {
                    tool: tool_name.to_string(),
                    errors,
                });
            }
        }

        let arguments = if self.options.transform_arguments {
            self.transformer.transform(tool_name, arguments)
        } else {
            arguments
        };

        let timeout = Duration::from_millis(context.timeout_ms.unwrap_or(self.options.timeout_ms));
        let max_attempts = context
            .max_retries
            .unwrap_or(self.options.max_retries)
            .saturating_add(1);
        let retry_delay = Duration::from_millis(self.options.retry_delay_ms);

        tracing::info!(
            request_id = %context.request_id,
            caller = context.caller.as_deref().unwrap_or("-"),
            server = server_id,
            tool = tool_name,
            "executing tool"
        );

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(retry_delay).await;
            }

            let attempt_start = Instant::now();
            let outcome = self.attempt(server_id, tool_name, arguments.clone(), timeout).await;
            let attempt_ms = attempt_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) => {
                    self.report_usage(server_id, tool_name, result.success, attempt_ms);
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::info!(
                        request_id = %context.request_id,
                        server = server_id,
                        tool = tool_name,
                        success = result.success,
                        attempt,
                        elapsed_ms,
                        "tool call completed"
                    );
                    return Ok(ExecutionOutcome {
                        request_id: context.request_id.clone(),
                        server_id: server_id.to_string(),
                        result,
                        attempts: attempt,
                        elapsed_ms,
                    });
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(reason)) => {
                    self.report_usage(server_id, tool_name, false, attempt_ms);
                    tracing::warn!(
                        request_id = %context.request_id,
                        server = server_id,
                        tool = tool_name,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "tool call attempt failed"
                    );
                    last_error = reason;
                }
            }
        }

        Err(ExecutionError::Failed {
            server_id: server_id.to_string(),
            tool: tool_name.to_string(),
            arguments,
            attempts: max_attempts,
            elapsed_ms: start.elapsed().as_millis() as u64,
            last_error,
        })
    }

    /// Look the tool up in the registry. A server that has never been
    /// connected has no tool list yet, so it is connected once first.
    async fn resolve_tool(&self, server_id: &str, tool_name: &str) -> Result<McpTool, ExecutionError> {
        let state = self
            .registry
            .get(server_id)
            .ok_or_else(|| ExecutionError::ServerNotFound {
                server_id: server_id.to_string(),
            })?;

        if let Some(tool) = state.tool(tool_name) {
            return Ok(tool.clone());
        }

        if state.status != ServerStatus::Running && !state.config.disabled {
            if let Err(e) = self.pool.get_or_connect(server_id).await {
                tracing::warn!(server = server_id, error = %e, "could not connect to resolve tool");
            }
            if let Ok(tool) = self.registry.find_tool(server_id, tool_name) {
                return Ok(tool);
            }
        }

        Err(ExecutionError::ToolNotFound {
            server_id: server_id.to_string(),
            tool: tool_name.to_string(),
        })
    }

    async fn attempt(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, AttemptError> {
        let client = self
            .pool
            .get_or_connect(server_id)
            .await
            .map_err(|e| classify(server_id, tool_name, e))?;

        match tokio::time::timeout(timeout, client.call_tool(tool_name, arguments)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(classify(server_id, tool_name, e)),
            Err(_) => Err(AttemptError::Retryable(format!(
                "tool call timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    fn report_usage(&self, server_id: &str, tool_name: &str, success: bool, elapsed_ms: u64) {
        if let Some(discovery) = &self.discovery {
            discovery.update_tool_usage(server_id, tool_name, success, elapsed_ms);
        }
    }

    /// Close every connection this executor opened.
    pub async fn shutdown(&self) {
        self.pool.disconnect_all().await;
    }
}

enum AttemptError {
    /// Stop immediately and surface this error.
    Fatal(ExecutionError),
    Retryable(String),
}

fn classify(server_id: &str, tool_name: &str, e: McpError) -> AttemptError {
    match e {
        McpError::ServerNotFound { id } => {
            AttemptError::Fatal(ExecutionError::ServerNotFound { server_id: id })
        }
        McpError::UnknownTool { .. } => AttemptError::Fatal(ExecutionError::ToolNotFound {
            server_id: server_id.to_string(),
            tool: tool_name.to_string(),
        }),
        other => AttemptError::Retryable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{DiscoveryOptions, ServerConfig, ToolInputSchema};
    use serde_json::json;

    fn read_file_tool() -> McpTool {
        McpTool {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: serde_json::from_value::<ToolInputSchema>(json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }))
            .unwrap(),
        }
    }

    /// A registry whose server advertises `read_file` but cannot be spawned.
    fn unreachable_registry() -> Arc<ServerRegistry> {
        let registry = Arc::new(ServerRegistry::new());
        registry
            .register(ServerConfig::new("fs", "/definitely/not/a/real/binary"))
            .unwrap();
        registry.update_tools("fs", vec![read_file_tool()]).unwrap();
        registry
    }

    fn fast_options(max_retries: u32) -> ExecutorOptions {
        ExecutorOptions {
            max_retries,
            retry_delay_ms: 1,
            timeout_ms: 1_000,
            ..ExecutorOptions::default()
        }
    }

    #[test]
    fn test_options_defaults() {
        let options: ExecutorOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, ExecutorOptions::default());
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_delay_ms, 1_000);
        assert!(options.validate_arguments && options.transform_arguments);
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = ExecutionContext::new();
        let b = ExecutionContext::new().with_caller("planner").with_max_retries(0);
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(b.caller.as_deref(), Some("planner"));
        assert_eq!(b.max_retries, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let executor = ToolExecutor::new(
            Arc::new(ServerRegistry::new()),
            fast_options(0),
            TransportOptions::default(),
        );
        let err = executor
            .execute_tool("nope", "read_file", json!({}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_retry() {
        let executor = ToolExecutor::new(unreachable_registry(), fast_options(3), TransportOptions::default());
        let err = executor
            .execute_tool("fs", "write_file", json!({}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_validation_failures_are_not_retried() {
        let registry = unreachable_registry();
        let executor = ToolExecutor::new(Arc::clone(&registry), fast_options(3), TransportOptions::default());

        let err = executor
            .execute_tool("fs", "read_file", json!({}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidArguments { ref errors, .. } if errors.len() == 1));

        let err = executor
            .execute_tool("fs", "read_file", json!({"path": 42}), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidArguments { .. }));

        // Never reached the process.
        assert_eq!(registry.get("fs").unwrap().status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let registry = unreachable_registry();
        let discovery = Arc::new(ToolDiscovery::new(
            Arc::clone(&registry),
            DiscoveryOptions::default(),
            TransportOptions::default(),
        ));
        let executor = ToolExecutor::new(Arc::clone(&registry), fast_options(2), TransportOptions::default())
            .with_discovery(discovery);

        let err = executor
            .execute_tool("fs", "read_file", json!({"path": "/x"}), &ExecutionContext::new())
            .await
            .unwrap_err();
        match err {
            ExecutionError::Failed {
                server_id,
                tool,
                arguments,
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(server_id, "fs");
                assert_eq!(tool, "read_file");
                assert_eq!(arguments, json!({"path": "/x"}));
                assert_eq!(attempts, 3);
                assert!(last_error.contains("failed to spawn"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.get("fs").unwrap().status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_context_overrides_retry_budget() {
        let executor = ToolExecutor::new(unreachable_registry(), fast_options(5), TransportOptions::default());
        let context = ExecutionContext::new().with_max_retries(0);
        let err = executor
            .execute_tool("fs", "read_file", json!({"path": "/x"}), &context)
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 1);
    }
}
