//! JSON-RPC over stdio transport.
//!
//! Owns one server process and its framed request/response stream:
//! - Writing newline-delimited JSON-RPC requests to stdin
//! - Buffering stdout, splitting complete lines, dispatching each message
//! - Correlating responses to pending requests by id, with per-request timeouts
//! - Broadcasting unmatched messages (notifications) to observers
//!
//! Nothing is retried here; retry is a policy layered on top.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framing::LineBuffer;
use super::lifecycle;
use super::types::{
    CallToolParams, CallToolResult, ConnectionState, Implementation, InitializeParams,
    InitializeResult, JsonRpcMessage, ListToolsResult, McpTool, RequestId, ServerConfig,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of each read from the server's stdout.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Capacity of the observer broadcast channel.
const OBSERVER_CAPACITY: usize = 64;

// ─── Options ─────────────────────────────────────────────────────────────────

fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Transport timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Per-request response budget.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a stopping server may take to exit before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TransportOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ─── Inbound side ────────────────────────────────────────────────────────────

type PendingSender = oneshot::Sender<Result<Value, McpError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the transport handle and its reader tasks.
struct Inbound {
    server: String,
    /// `id → continuation` for every request still awaiting a response.
    pending: Mutex<HashMap<u64, PendingSender>>,
    state: Mutex<ConnectionState>,
    observers: broadcast::Sender<JsonRpcMessage>,
    stderr_tail: Mutex<VecDeque<String>>,
    /// Set once when a live connection is lost without `disconnect()`.
    lost: watch::Sender<Option<String>>,
}

impl Inbound {
    fn new(server: &str) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let (lost, _) = watch::channel(None);
        Self {
            server: server.to_string(),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::default()),
            observers,
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            lost,
        }
    }

    fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, McpError>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        rx
    }

    /// Drop a pending entry without settling it. Returns whether it existed.
    fn forget(&self, id: u64) -> bool {
        lock(&self.pending).remove(&id).is_some()
    }

    fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Parse one framed line and route it. Malformed lines are dropped.
    fn dispatch_line(&self, line: &str) {
        match JsonRpcMessage::parse(line) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                let preview: String = line.chars().take(200).collect();
                tracing::warn!(
                    server = %self.server,
                    error = %e,
                    line = %preview,
                    "dropping unparseable line from server"
                );
            }
        }
    }

    fn dispatch(&self, message: JsonRpcMessage) {
        lock(&self.state).last_activity = Some(Utc::now());

        match message {
            JsonRpcMessage::Response {
                id: RequestId::Number(id),
                result,
            } => self.settle(id, Ok(result)),
            JsonRpcMessage::Error {
                id: RequestId::Number(id),
                error,
            } => self.settle(
                id,
                Err(McpError::ServerError {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
            ),
            other => {
                tracing::debug!(
                    server = %self.server,
                    method = other.method().unwrap_or("-"),
                    "broadcasting unsolicited message"
                );
                // No observers is fine.
                let _ = self.observers.send(other);
            }
        }
    }

    fn settle(&self, id: u64, outcome: Result<Value, McpError>) {
        let sender = lock(&self.pending).remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(server = %self.server, id, "requester went away before response");
                }
            }
            None => {
                tracing::debug!(
                    server = %self.server,
                    id,
                    "response for unknown or expired request dropped"
                );
            }
        }
    }

    /// Reject every pending request with a clone of `error`.
    fn reject_all(&self, error: &McpError) -> usize {
        let drained: Vec<PendingSender> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Flip to disconnected. Returns whether the connection was live.
    fn mark_disconnected(&self) -> bool {
        let mut state = lock(&self.state);
        let was_connected = state.connected;
        state.connected = false;
        state.initialized = false;
        was_connected
    }

    /// The output stream ended: the process is gone or unreadable.
    fn close(&self, reason: &str) {
        let was_connected = self.mark_disconnected();
        let error = McpError::ServerCrashed {
            server: self.server.clone(),
            reason: reason.to_string(),
        };
        let rejected = self.reject_all(&error);
        if was_connected {
            tracing::warn!(server = %self.server, reason, rejected, "server connection lost");
            self.lost.send_replace(Some(reason.to_string()));
        } else {
            tracing::debug!(server = %self.server, reason, "reader finished after disconnect");
        }
    }

    fn push_stderr(&self, line: String) {
        let mut tail = lock(&self.stderr_tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Removes a pending entry if the awaiting future is dropped early.
struct PendingGuard<'a> {
    inbound: &'a Inbound,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inbound.forget(self.id);
    }
}

async fn read_stdout(inbound: Arc<Inbound>, mut stdout: ChildStdout) {
    let mut framer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let reason = loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break "stdout closed".to_string(),
            Ok(n) => {
                framer.extend(&chunk[..n]);
                for line in framer.lines() {
                    inbound.dispatch_line(&line);
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    if let Some(rest) = framer.take_remainder() {
        inbound.dispatch_line(&rest);
    }
    inbound.close(&reason);
}

async fn drain_stderr(inbound: Arc<Inbound>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(server = %inbound.server, "[stderr] {line}");
                inbound.push_stderr(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %inbound.server, error = %e, "stderr read error");
                break;
            }
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over one server process's stdio.
pub struct StdioTransport {
    config: ServerConfig,
    options: TransportOptions,
    next_id: AtomicU64,
    inbound: Arc<Inbound>,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create an unconnected transport for `config`.
    pub fn new(config: ServerConfig, options: TransportOptions) -> Self {
        let inbound = Arc::new(Inbound::new(&config.id));
        Self {
            config,
            options,
            next_id: AtomicU64::new(1),
            inbound,
            writer: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server process and start reading its output.
    ///
    /// Spawn failures are returned here. A transport that is already
    /// connected is left as is.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.is_connected() {
            return Ok(());
        }

        let spawned = lifecycle::spawn_process(&self.config)?;
        let pid = spawned.child.id();
        *lock(&self.pid) = pid;

        {
            let mut state = lock(&self.inbound.state);
            *state = ConnectionState {
                connected: true,
                last_activity: Some(Utc::now()),
                ..ConnectionState::default()
            };
        }

        *self.writer.lock().await = Some(spawned.stdin);
        *self.child.lock().await = Some(spawned.child);

        let reader = tokio::spawn(read_stdout(Arc::clone(&self.inbound), spawned.stdout));
        let diagnostics = tokio::spawn(drain_stderr(Arc::clone(&self.inbound), spawned.stderr));
        lock(&self.tasks).extend([reader, diagnostics]);

        tracing::info!(
            server = %self.config.id,
            command = %self.config.command,
            pid = ?pid,
            "server process spawned"
        );
        Ok(())
    }

    /// Reject pending requests, close stdin, signal the process and wait up
    /// to the grace period before killing it.
    pub async fn disconnect(&self) {
        let was_connected = self.inbound.mark_disconnected();
        let rejected = self.inbound.reject_all(&McpError::TransportError {
            server: self.config.id.clone(),
            reason: "connection closed by client (disconnected)".into(),
        });

        // Closing stdin is the first request to exit.
        drop(self.writer.lock().await.take());

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let status =
                lifecycle::terminate(&mut child, self.options.shutdown_grace(), &self.config.id)
                    .await;
            tracing::info!(
                server = %self.config.id,
                status = ?status,
                rejected,
                was_connected,
                "server process stopped"
            );
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        *lock(&self.pid) = None;
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request and await its correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, self.options.request_timeout())
            .await
    }

    /// Send a request with an explicit response budget.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected {
                server: self.config.id.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.inbound.register(id);
        let _guard = PendingGuard {
            inbound: &self.inbound,
            id,
        };

        self.write_message(&JsonRpcMessage::request(id, method, params))
            .await?;
        tracing::debug!(server = %self.config.id, id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ServerCrashed {
                server: self.config.id.clone(),
                reason: "response channel closed".into(),
            }),
            Err(_) => {
                self.inbound.forget(id);
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(server = %self.config.id, id, method, timeout_ms, "request timed out");
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_message(&JsonRpcMessage::notification(method, params))
            .await
    }

    async fn write_message(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        let line = message.to_line().map_err(|e| McpError::TransportError {
            server: self.config.id.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::NotConnected {
            server: self.config.id.clone(),
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.config.id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.config.id.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    // ─── MCP Operations ──────────────────────────────────────────────────

    /// Perform the `initialize` handshake and send `notifications/initialized`.
    pub async fn initialize(&self, client_info: Implementation) -> Result<InitializeResult, McpError> {
        let params = to_params("initialize", &InitializeParams::new(client_info))?;
        let value = self.request("initialize", Some(params)).await?;
        let result: InitializeResult =
            serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
                method: "initialize".into(),
                reason: e.to_string(),
            })?;

        {
            let mut state = lock(&self.inbound.state);
            state.initialized = true;
            state.protocol_version = Some(
                result
                    .protocol_version
                    .clone()
                    .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            );
            state.server_info = result.server_info.clone();
        }

        self.notify("notifications/initialized", None).await?;

        tracing::info!(
            server = %self.config.id,
            protocol_version = ?result.protocol_version,
            remote = ?result.server_info.as_ref().map(|s| s.name.as_str()),
            "handshake complete"
        );
        Ok(result)
    }

    /// List the server's tools, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.request("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
                    method: "tools/list".into(),
                    reason: e.to_string(),
                })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Invoke one tool.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: (!arguments.is_null()).then_some(arguments),
        };
        let value = self
            .request("tools/call", Some(to_params("tools/call", &params)?))
            .await?;
        serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
            method: "tools/call".into(),
            reason: e.to_string(),
        })
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Read-only snapshot of the connection.
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inbound.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inbound.state).connected
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inbound.state).initialized
    }

    pub fn process_id(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inbound.pending_count()
    }

    /// The most recent stderr lines from the server.
    pub fn recent_stderr(&self) -> Vec<String> {
        lock(&self.inbound.stderr_tail).iter().cloned().collect()
    }

    /// Observe notifications and other unsolicited server messages.
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcMessage> {
        self.inbound.observers.subscribe()
    }

    /// Watch for the process exiting on its own. The value becomes the
    /// reason once the live connection is lost; `disconnect()` never sets it.
    pub fn connection_lost(&self) -> watch::Receiver<Option<String>> {
        self.inbound.lost.subscribe()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The child itself is killed on drop.
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn to_params<T: Serialize>(method: &str, params: &T) -> Result<Value, McpError> {
    serde_json::to_value(params).map_err(|e| McpError::InvalidResponse {
        method: method.to_string(),
        reason: format!("failed to encode params: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
