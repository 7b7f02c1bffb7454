//! Tool discovery: walk registered servers, tag tools with capabilities and
//! track rolling usage statistics.
//!
//! Capability tags are inferred from a tool's name and description against an
//! ordered keyword table. Usage statistics are exponential moving averages
//! updated in place, so memory stays bounded regardless of call volume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::pool::ClientPool;
use super::registry::ServerRegistry;
use super::transport::TransportOptions;
use super::types::McpTool;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Weight of the newest sample in the moving averages.
pub const EMA_WEIGHT: f64 = 0.1;

/// Success rate assigned to a tool before its first recorded use.
const INITIAL_SUCCESS_RATE: f64 = 1.0;

/// Ordered capability keyword groups. Each alternation is matched as a whole
/// word (plus a plural or inflected ending) against the name and description
/// with separators (`_`, `-`, `.`, `/`, `:`) turned into spaces.
static CAPABILITY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let groups: [(&str, &str); 17] = [
        ("search", "search|find|query|queries|lookup|look up|grep|locate"),
        ("read", "read|get|fetch|load|retrieve|view|show|cat|open"),
        ("write", "write|writing|written|create|save|put|insert|add|store|append"),
        ("update", "update|modify|modifies|edit|patch|change|set|rename|replace"),
        ("delete", "delete|remove|drop|erase|unlink|destroy|purge"),
        ("list", "list|enumerate|ls|browse|index|indices|catalog"),
        ("execute", "exec|execute|execution|run|running|invoke|launch|spawn|shell|command"),
        ("analyze", "analyze|analyse|analysis|analyses|inspect|examine|evaluate|stats|statistics|metric|profile"),
        ("transform", "transform|convert|format|parse|encode|decode|translate|compress"),
        ("validate", "validate|validation|verify|verifies|check|lint|assert|sanitize|sanitise"),
        ("filesystem", "file|dir|directory|directories|folder|path|fs|disk"),
        ("http", "http|https|url|uri|api|web|download|upload|request|endpoint"),
        ("database", "database|db|sql|sqlite|postgres|table|record|collection|schema"),
        ("git", "git|commit|branch|branches|merge|diff|repo|repository|repositories|checkout"),
        ("test", "test|spec|benchmark|coverage"),
        ("code", "code|function|class|classes|symbol|compile|refactor|source|snippet"),
        ("documentation", "doc|docs|documentation|readme|markdown|manual|comment"),
    ];
    groups
        .into_iter()
        .filter_map(|(tag, words)| {
            let pattern = format!(r"(?i)\b(?:{words})(?:s|es|d|ed|ing|er|ers)?\b");
            match Regex::new(&pattern) {
                Ok(re) => Some((tag, re)),
                Err(e) => {
                    tracing::error!(tag, error = %e, "invalid capability pattern");
                    None
                }
            }
        })
        .collect()
});

// ─── Types ──────────────────────────────────────────────────────────────────

/// A tool enriched with provenance, capability tags and usage statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredTool {
    #[serde(flatten)]
    pub tool: McpTool,
    pub server_id: String,
    pub server_name: String,
    pub capabilities: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    /// EMA of call success (1.0 = always succeeds).
    pub success_rate: f64,
    /// EMA of call latency in milliseconds.
    pub avg_execution_ms: f64,
    pub usage_count: u64,
}

impl DiscoveredTool {
    fn new(server_id: &str, server_name: &str, tool: McpTool) -> Self {
        let capabilities = infer_capabilities(&tool.name, &tool.description);
        Self {
            tool,
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            capabilities,
            discovered_at: Utc::now(),
            last_used: None,
            success_rate: INITIAL_SUCCESS_RATE,
            avg_execution_ms: 0.0,
            usage_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.tool.name
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    /// Fold one usage sample into the moving averages.
    ///
    /// Not atomic: callers hold the discovery lock while updating.
    fn record_usage(&mut self, success: bool, elapsed_ms: u64) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = ema(self.success_rate, sample, EMA_WEIGHT);
        self.avg_execution_ms = ema(self.avg_execution_ms, elapsed_ms as f64, EMA_WEIGHT);
        self.last_used = Some(Utc::now());
        self.usage_count += 1;
    }
}

/// Exponential moving average: `old * (1 - weight) + sample * weight`.
pub fn ema(old: f64, sample: f64, weight: f64) -> f64 {
    old * (1.0 - weight) + sample * weight
}

/// Tag a tool by matching its name and description against the keyword groups.
pub fn infer_capabilities(name: &str, description: &str) -> Vec<String> {
    let text: String = format!("{name} {description}")
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.' | '/' | ':') { ' ' } else { c })
        .collect();

    let mut tags: Vec<String> = Vec::new();
    for (tag, pattern) in CAPABILITY_PATTERNS.iter() {
        if pattern.is_match(&text) && !tags.iter().any(|t| t == tag) {
            tags.push((*tag).to_string());
        }
    }
    tags
}

fn default_min_success_rate() -> f64 {
    0.3
}

/// Discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    /// Background re-discovery period; `None` disables the timer.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Tools whose success rate falls below this are pruned.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            interval_ms: None,
            min_success_rate: default_min_success_rate(),
        }
    }
}

/// Counts from one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub servers_discovered: usize,
    pub tools_discovered: usize,
    /// Tools seen for the first time (the rest were refreshed).
    pub new_tools: usize,
}

// ─── ToolDiscovery ──────────────────────────────────────────────────────────

fn tool_key(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}.{tool_name}")
}

/// Discovers tools across registered servers and tracks their usage.
pub struct ToolDiscovery {
    registry: Arc<ServerRegistry>,
    pool: ClientPool,
    options: DiscoveryOptions,
    /// `"server.tool" → DiscoveredTool`.
    tools: RwLock<HashMap<String, DiscoveredTool>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ToolDiscovery {
    pub fn new(
        registry: Arc<ServerRegistry>,
        options: DiscoveryOptions,
        transport: TransportOptions,
    ) -> Self {
        let pool = ClientPool::new(Arc::clone(&registry), transport);
        Self {
            registry,
            pool,
            options,
            tools: RwLock::new(HashMap::new()),
            timer: Mutex::new(None),
        }
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    /// Walk every registered, non-disabled server and refresh its tools.
    ///
    /// Servers that cannot be reached are logged and skipped.
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for state in self.registry.list() {
            if state.config.disabled {
                continue;
            }
            let server_id = state.config.id.clone();
            let server_name = state.config.display_name().to_string();

            // A fresh connect has just listed tools during its handshake.
            let listed = match self.pool.checkout(&server_id).await {
                Ok((client, true)) => Ok(client.tools()),
                Ok((client, false)) => client.refresh_tools().await,
                Err(e) => Err(e),
            };
            let tools = match listed {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "tool discovery failed for server");
                    continue;
                }
            };

            report.servers_discovered += 1;
            report.tools_discovered += tools.len();
            report.new_tools += self.merge_server_tools(&server_id, &server_name, tools);
        }

        tracing::info!(
            servers = report.servers_discovered,
            tools = report.tools_discovered,
            new_tools = report.new_tools,
            "tool discovery complete"
        );
        report
    }

    /// Fold one server's listing into the tracked set. Returns how many were new.
    fn merge_server_tools(&self, server_id: &str, server_name: &str, tools: Vec<McpTool>) -> usize {
        let mut tracked = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let listed: Vec<String> = tools.iter().map(|t| tool_key(server_id, &t.name)).collect();

        // Forget tools this server no longer advertises.
        tracked.retain(|key, t| t.server_id != server_id || listed.contains(key));

        let mut new_tools = 0;
        for tool in tools {
            let key = tool_key(server_id, &tool.name);
            match tracked.get_mut(&key) {
                Some(existing) => {
                    existing.capabilities = infer_capabilities(&tool.name, &tool.description);
                    existing.server_name = server_name.to_string();
                    existing.tool = tool;
                }
                None => {
                    tracing::debug!(server = server_id, tool = %tool.name, "new tool discovered");
                    tracked.insert(key, DiscoveredTool::new(server_id, server_name, tool));
                    new_tools += 1;
                }
            }
        }
        new_tools
    }

    // ─── Usage Statistics ───────────────────────────────────────────────

    /// Record one call outcome. Unknown tools are ignored.
    pub fn update_tool_usage(&self, server_id: &str, tool_name: &str, success: bool, elapsed_ms: u64) {
        let mut tracked = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tool) = tracked.get_mut(&tool_key(server_id, tool_name)) {
            tool.record_usage(success, elapsed_ms);
        }
    }

    /// Remove every tool whose success rate fell below the configured floor.
    pub fn prune_low_success_tools(&self) -> usize {
        let floor = self.options.min_success_rate;
        let mut tracked = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let before = tracked.len();
        tracked.retain(|key, tool| {
            let keep = tool.success_rate >= floor;
            if !keep {
                tracing::info!(tool = %key, success_rate = tool.success_rate, "pruning unreliable tool");
            }
            keep
        });
        before - tracked.len()
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// All tracked tools, ordered by server then name.
    pub fn tools(&self) -> Vec<DiscoveredTool> {
        let mut tools: Vec<DiscoveredTool> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tools.sort_by(|a, b| (&a.server_id, a.name()).cmp(&(&b.server_id, b.name())));
        tools
    }

    pub fn get_tool(&self, server_id: &str, tool_name: &str) -> Option<DiscoveredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tool_key(server_id, tool_name))
            .cloned()
    }

    pub fn tools_for_server(&self, server_id: &str) -> Vec<DiscoveredTool> {
        self.tools()
            .into_iter()
            .filter(|t| t.server_id == server_id)
            .collect()
    }

    pub fn find_by_capability(&self, tag: &str) -> Vec<DiscoveredTool> {
        self.tools()
            .into_iter()
            .filter(|t| t.has_capability(tag))
            .collect()
    }

    /// Case-insensitive substring search over names and descriptions.
    pub fn search(&self, query: &str) -> Vec<DiscoveredTool> {
        let needle = query.to_lowercase();
        self.tools()
            .into_iter()
            .filter(|t| {
                t.tool.name.to_lowercase().contains(&needle)
                    || t.tool.description.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// The most reliable tool with `tag`: highest success rate, then fastest.
    pub fn best_tool_for(&self, tag: &str) -> Option<DiscoveredTool> {
        self.find_by_capability(tag).into_iter().max_by(|a, b| {
            a.success_rate
                .total_cmp(&b.success_rate)
                .then_with(|| b.avg_execution_ms.total_cmp(&a.avg_execution_ms))
        })
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Background Timer ───────────────────────────────────────────────

    /// Re-run [`Self::discover`] every `interval_ms`. No-op without an
    /// interval or when the timer already runs.
    pub fn start_auto_discovery(self: &Arc<Self>) -> bool {
        let Some(interval_ms) = self.options.interval_ms.filter(|ms| *ms > 0) else {
            return false;
        };
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return false;
        }

        let discovery = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(discovery) = discovery.upgrade() else {
                    break;
                };
                let report = discovery.discover().await;
                tracing::debug!(?report, "scheduled discovery finished");
            }
        }));
        tracing::info!(interval_ms, "auto-discovery started");
        true
    }

    pub fn stop_auto_discovery(&self) -> bool {
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!("auto-discovery stopped");
                true
            }
            None => false,
        }
    }

    /// Stop the timer and close every connection this component opened.
    pub async fn shutdown(&self) {
        self.stop_auto_discovery();
        self.pool.disconnect_all().await;
    }
}

impl Drop for ToolDiscovery {
    fn drop(&mut self) {
        if let Some(handle) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::ServerConfig;

    fn tool(name: &str, description: &str) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: Default::default(),
        }
    }

    fn discovery_with(tools: Vec<McpTool>) -> ToolDiscovery {
        let discovery = ToolDiscovery::new(
            Arc::new(ServerRegistry::new()),
            DiscoveryOptions::default(),
            TransportOptions::default(),
        );
        discovery.merge_server_tools("fs", "Filesystem", tools);
        discovery
    }

    #[test]
    fn test_infer_capabilities_splits_identifiers() {
        let tags = infer_capabilities("read_file", "Read the contents of a file from disk");
        assert_eq!(tags, vec!["read", "filesystem"]);
    }

    #[test]
    fn test_infer_capabilities_is_case_insensitive_and_ordered() {
        let tags = infer_capabilities("GitCommit", "Create a Git commit in the REPO");
        assert!(tags.contains(&"write".to_string()));
        assert!(tags.contains(&"git".to_string()));
        let write_pos = tags.iter().position(|t| t == "write").unwrap();
        let git_pos = tags.iter().position(|t| t == "git").unwrap();
        assert!(write_pos < git_pos);
    }

    #[test]
    fn test_infer_capabilities_deduplicates() {
        let tags = infer_capabilities("search_files", "search and find files, then search again");
        assert_eq!(tags.iter().filter(|t| *t == "search").count(), 1);
    }

    #[test]
    fn test_infer_capabilities_matches_whole_words() {
        assert!(infer_capabilities("category", "").is_empty());
        assert!(infer_capabilities("get_settings", "").iter().all(|t| t != "update"));
        assert!(infer_capabilities("address", "").is_empty());
        assert!(infer_capabilities("docker", "").is_empty());
        assert!(infer_capabilities("status", "").is_empty());

        let tags = infer_capabilities("list_files", "Lists files and directories");
        assert_eq!(tags, vec!["list", "filesystem"]);
        assert_eq!(infer_capabilities("run_tests", ""), vec!["execute", "test"]);
    }

    #[test]
    fn test_infer_capabilities_none() {
        assert!(infer_capabilities("echo", "Say it back").is_empty());
    }

    #[test]
    fn test_ema() {
        assert!((ema(1.0, 0.0, 0.1) - 0.9).abs() < 1e-12);
        assert!((ema(0.0, 100.0, 0.1) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_success_rate_mixed_outcomes_between_bounds() {
        for order in [[true, false], [false, true]] {
            let discovery = discovery_with(vec![tool("read_file", "")]);
            for success in order {
                discovery.update_tool_usage("fs", "read_file", success, 10);
            }
            let rate = discovery.get_tool("fs", "read_file").unwrap().success_rate;
            assert!(rate > 0.0 && rate < 1.0, "rate {rate} for {order:?}");
        }
    }

    #[test]
    fn test_success_rate_converges_monotonically() {
        let discovery = discovery_with(vec![tool("read_file", "")]);
        for _ in 0..5 {
            discovery.update_tool_usage("fs", "read_file", false, 10);
        }
        let mut previous = discovery.get_tool("fs", "read_file").unwrap().success_rate;
        for _ in 0..60 {
            discovery.update_tool_usage("fs", "read_file", true, 10);
            let rate = discovery.get_tool("fs", "read_file").unwrap().success_rate;
            assert!(rate > previous && rate <= 1.0);
            previous = rate;
        }
        assert!(previous > 0.99);
    }

    #[test]
    fn test_usage_of_unknown_tool_is_ignored() {
        let discovery = discovery_with(vec![tool("read_file", "")]);
        discovery.update_tool_usage("fs", "write_file", false, 10);
        discovery.update_tool_usage("db", "read_file", false, 10);
        let tracked = discovery.get_tool("fs", "read_file").unwrap();
        assert_eq!(tracked.usage_count, 0);
        assert_eq!(tracked.success_rate, 1.0);
    }

    #[test]
    fn test_latency_average_and_last_used() {
        let discovery = discovery_with(vec![tool("read_file", "")]);
        discovery.update_tool_usage("fs", "read_file", true, 200);
        let tracked = discovery.get_tool("fs", "read_file").unwrap();
        assert!((tracked.avg_execution_ms - 20.0).abs() < 1e-9);
        assert!(tracked.last_used.is_some());
        assert_eq!(tracked.usage_count, 1);
    }

    #[test]
    fn test_prune_low_success_tools() {
        let discovery = discovery_with(vec![tool("read_file", ""), tool("write_file", "")]);
        for _ in 0..20 {
            discovery.update_tool_usage("fs", "write_file", false, 10);
        }
        assert_eq!(discovery.prune_low_success_tools(), 1);
        assert!(discovery.get_tool("fs", "write_file").is_none());
        assert!(discovery.get_tool("fs", "read_file").is_some());
        assert_eq!(discovery.prune_low_success_tools(), 0);
    }

    #[test]
    fn test_merge_refreshes_and_counts_new() {
        let discovery = discovery_with(vec![tool("read_file", ""), tool("list_dir", "")]);
        discovery.update_tool_usage("fs", "read_file", false, 10);

        let new = discovery.merge_server_tools(
            "fs",
            "Filesystem v2",
            vec![tool("read_file", "Read a file"), tool("move_file", "")],
        );
        assert_eq!(new, 1);
        assert!(discovery.get_tool("fs", "list_dir").is_none());

        let refreshed = discovery.get_tool("fs", "read_file").unwrap();
        assert_eq!(refreshed.server_name, "Filesystem v2");
        assert_eq!(refreshed.tool.description, "Read a file");
        assert_eq!(refreshed.usage_count, 1);
    }

    #[test]
    fn test_queries() {
        let discovery = discovery_with(vec![
            tool("read_file", "Read a file"),
            tool("fetch_url", "Download an HTTP resource"),
            tool("cat", "Print file contents"),
        ]);
        assert_eq!(discovery.len(), 3);
        assert_eq!(discovery.tools_for_server("fs").len(), 3);
        assert_eq!(discovery.search("http").len(), 1);
        assert_eq!(discovery.find_by_capability("HTTP").len(), 1);

        for _ in 0..3 {
            discovery.update_tool_usage("fs", "read_file", false, 5);
        }
        let best = discovery.best_tool_for("read").unwrap();
        assert_ne!(best.name(), "read_file");
    }

    #[tokio::test]
    async fn test_discover_skips_unreachable_and_disabled_servers() {
        let registry = Arc::new(ServerRegistry::new());
        registry
            .register(ServerConfig::new("ghost", "/definitely/not/a/real/binary"))
            .unwrap();
        let mut disabled = ServerConfig::new("off", "/definitely/not/a/real/binary");
        disabled.disabled = true;
        registry.register(disabled).unwrap();

        let discovery = ToolDiscovery::new(
            Arc::clone(&registry),
            DiscoveryOptions::default(),
            TransportOptions::default(),
        );
        let report = discovery.discover().await;
        assert_eq!(report, DiscoveryReport::default());
        assert!(discovery.is_empty());
        assert_eq!(
            registry.get("off").unwrap().status,
            crate::mcp_client::registry::ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_auto_discovery_requires_interval() {
        let discovery = Arc::new(ToolDiscovery::new(
            Arc::new(ServerRegistry::new()),
            DiscoveryOptions::default(),
            TransportOptions::default(),
        ));
        assert!(!discovery.start_auto_discovery());

        let discovery = Arc::new(ToolDiscovery::new(
            Arc::new(ServerRegistry::new()),
            DiscoveryOptions {
                interval_ms: Some(50),
                ..DiscoveryOptions::default()
            },
            TransportOptions::default(),
        ));
        assert!(discovery.start_auto_discovery());
        assert!(!discovery.start_auto_discovery());
        assert!(discovery.stop_auto_discovery());
        assert!(!discovery.stop_auto_discovery());
    }
}
