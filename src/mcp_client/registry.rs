//! Server registry: configurations and lifecycle state of every tool server.
//!
//! Provides:
//! - Registration / unregistration keyed by server id
//! - The status state machine (stopped → starting → running → stopping / error)
//! - The tool list each server published on its last successful handshake
//! - Live statistics recomputed from the map on every call
//!
//! The registry is an explicitly constructed store, shared as
//! `Arc<ServerRegistry>` by clients, discovery and the executor. It is the
//! only place server state is mutated.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::{McpTool, ServerConfig};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Everything the registry knows about one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub tools: Vec<McpTool>,
    pub last_error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            pid: None,
            tools: Vec::new(),
            last_error: None,
            start_time: None,
        }
    }

    /// Look up one of this server's tools by name.
    pub fn tool(&self, name: &str) -> Option<&McpTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn apply(&mut self, update: StateUpdate) {
        if let Some(pid) = update.pid {
            self.pid = pid;
        }
        if let Some(tools) = update.tools {
            self.tools = tools;
        }
        if let Some(last_error) = update.last_error {
            self.last_error = last_error;
        }
        if let Some(status) = update.status {
            self.status = status;
            match status {
                ServerStatus::Running => {
                    self.last_error = None;
                    self.start_time = Some(Utc::now());
                }
                ServerStatus::Error => {
                    self.start_time = None;
                    self.pid = None;
                }
                ServerStatus::Stopped => {
                    self.start_time = None;
                    self.pid = None;
                }
                ServerStatus::Starting | ServerStatus::Stopping => {}
            }
        }
    }
}

/// A partial update applied by [`ServerRegistry::update_state`].
///
/// `None` leaves a field untouched; the nested options on `pid` and
/// `last_error` allow clearing them explicitly.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<ServerStatus>,
    pub pid: Option<Option<u32>>,
    pub tools: Option<Vec<McpTool>>,
    pub last_error: Option<Option<String>>,
}

impl StateUpdate {
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_tools(mut self, tools: Vec<McpTool>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Aggregate counts, recomputed on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub stopped: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub error: usize,
    /// Servers currently running.
    pub active: usize,
    /// Tools across every registered server.
    pub total_tools: usize,
}

// ─── ServerRegistry ─────────────────────────────────────────────────────────

/// In-memory store of server configurations and lifecycle state.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<BTreeMap<String, ServerState>>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ServerState>> {
        self.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ServerState>> {
        self.servers.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Register a server in `stopped` state. Fails if the id is taken.
    pub fn register(&self, config: ServerConfig) -> Result<(), McpError> {
        let mut servers = self.write();
        if servers.contains_key(&config.id) {
            return Err(McpError::DuplicateServer { id: config.id });
        }
        tracing::info!(server = %config.id, command = %config.command, "server registered");
        servers.insert(config.id.clone(), ServerState::new(config));
        Ok(())
    }

    /// Remove a server. Fails while it is running.
    pub fn unregister(&self, id: &str) -> Result<ServerState, McpError> {
        let mut servers = self.write();
        let state = servers
            .get(id)
            .ok_or_else(|| McpError::ServerNotFound { id: id.to_string() })?;
        if state.status == ServerStatus::Running {
            return Err(McpError::InvalidState {
                id: id.to_string(),
                action: "unregister".into(),
                status: state.status,
            });
        }
        let removed = servers
            .remove(id)
            .ok_or_else(|| McpError::ServerNotFound { id: id.to_string() })?;
        tracing::info!(server = id, "server unregistered");
        Ok(removed)
    }

    /// Register every non-disabled entry; failures are logged and skipped.
    ///
    /// Returns the number of servers registered.
    pub fn load_from_config(&self, configs: &[ServerConfig]) -> usize {
        let mut registered = 0;
        for config in configs {
            if config.disabled {
                tracing::debug!(server = %config.id, "skipping disabled server");
                continue;
            }
            match self.register(config.clone()) {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::warn!(server = %config.id, error = %e, "failed to register server");
                }
            }
        }
        registered
    }

    /// Remove every server. Fails if any is running.
    pub fn clear(&self) -> Result<(), McpError> {
        let mut servers = self.write();
        if let Some(running) = servers
            .values()
            .find(|s| s.status == ServerStatus::Running)
        {
            return Err(McpError::InvalidState {
                id: running.config.id.clone(),
                action: "clear registry containing".into(),
                status: running.status,
            });
        }
        servers.clear();
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    /// Snapshot of one server's state.
    pub fn get(&self, id: &str) -> Option<ServerState> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Snapshots of every server, ordered by id.
    pub fn list(&self) -> Vec<ServerState> {
        self.read().values().cloned().collect()
    }

    /// Snapshots of every server in `status`.
    pub fn list_by_status(&self, status: ServerStatus) -> Vec<ServerState> {
        self.read()
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    /// Look up a tool's published schema.
    pub fn find_tool(&self, server_id: &str, tool_name: &str) -> Result<McpTool, McpError> {
        let servers = self.read();
        let state = servers.get(server_id).ok_or_else(|| McpError::ServerNotFound {
            id: server_id.to_string(),
        })?;
        state.tool(tool_name).cloned().ok_or_else(|| McpError::UnknownTool {
            server: server_id.to_string(),
            name: tool_name.to_string(),
        })
    }

    /// Counts by status plus tool totals, computed from the live map.
    pub fn statistics(&self) -> RegistryStatistics {
        let servers = self.read();
        let mut stats = RegistryStatistics {
            total: servers.len(),
            ..RegistryStatistics::default()
        };
        for state in servers.values() {
            match state.status {
                ServerStatus::Stopped => stats.stopped += 1,
                ServerStatus::Starting => stats.starting += 1,
                ServerStatus::Running => stats.running += 1,
                ServerStatus::Stopping => stats.stopping += 1,
                ServerStatus::Error => stats.error += 1,
            }
            stats.total_tools += state.tools.len();
        }
        stats.active = stats.running;
        stats
    }

    // ─── Mutators ───────────────────────────────────────────────────────

    /// Apply a partial update.
    pub fn update_state(&self, id: &str, update: StateUpdate) -> Result<(), McpError> {
        let mut servers = self.write();
        let state = servers
            .get_mut(id)
            .ok_or_else(|| McpError::ServerNotFound { id: id.to_string() })?;
        let previous = state.status;
        state.apply(update);
        if previous != state.status {
            tracing::debug!(server = id, from = %previous, to = %state.status, "server status changed");
        }
        Ok(())
    }

    /// Replace a server's tool list wholesale.
    pub fn update_tools(&self, id: &str, tools: Vec<McpTool>) -> Result<(), McpError> {
        self.update_state(
            id,
            StateUpdate {
                tools: Some(tools),
                ..StateUpdate::default()
            },
        )
    }

    pub fn set_status(&self, id: &str, status: ServerStatus) -> Result<(), McpError> {
        self.update_state(id, StateUpdate::status(status))
    }

    pub fn set_pid(&self, id: &str, pid: Option<u32>) -> Result<(), McpError> {
        self.update_state(id, StateUpdate::default().with_pid(pid))
    }

    /// Record a failure: status `error` with the message kept.
    pub fn set_error(&self, id: &str, message: &str) -> Result<(), McpError> {
        tracing::warn!(server = id, error = message, "server entered error state");
        self.update_state(
            id,
            StateUpdate {
                status: Some(ServerStatus::Error),
                last_error: Some(Some(message.to_string())),
                ..StateUpdate::default()
            },
        )
    }

    /// Record that the running process `pid` exited on its own.
    ///
    /// Only applies while the entry is still `running` with that pid, so a
    /// newer connection is never clobbered. Returns whether it applied.
    pub fn mark_exited(&self, id: &str, pid: u32, reason: &str) -> bool {
        let mut servers = self.write();
        let Some(state) = servers.get_mut(id) else {
            return false;
        };
        if state.status != ServerStatus::Running || state.pid != Some(pid) {
            return false;
        }
        tracing::warn!(server = id, pid, reason, "server process exited unexpectedly");
        state.apply(StateUpdate {
            status: Some(ServerStatus::Error),
            last_error: Some(Some(format!("server exited: {reason}"))),
            ..StateUpdate::default()
        });
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
