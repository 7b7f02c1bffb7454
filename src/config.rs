//! Runtime configuration loading and validation.
//!
//! Reads `toolhost.json` or `toolhost.yaml` and resolves environment
//! variables. Every section is optional and falls back to its defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::execution::{ExecutorOptions, HandlerOptions};
use crate::mcp_client::{DiscoveryOptions, McpError, ServerConfig, TransportOptions};

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLHOST_CONFIG";

/// File names searched for, in order.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["toolhost.json", "toolhost.yaml", "toolhost.yml"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default)]
    pub executor: ExecutorOptions,
    #[serde(default)]
    pub discovery: DiscoveryOptions,
    #[serde(default)]
    pub results: HandlerOptions,
}

impl RuntimeConfig {
    /// Reject configs that would fail halfway through registration.
    pub fn validate(&self) -> Result<(), McpError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: "server id must not be empty".into(),
                });
            }
            if server.command.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("server '{}' has an empty command", server.id),
                });
            }
            if !seen.insert(server.id.as_str()) {
                return Err(McpError::ConfigError {
                    reason: format!("duplicate server id '{}'", server.id),
                });
            }
        }
        Ok(())
    }

    /// Servers that are not disabled.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| !s.disabled)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLHOST_CONFIG` first, then searches upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find any of {}", CONFIG_FILE_NAMES.join(", ")),
    })
}

/// Load, interpolate, parse and validate a config file.
///
/// `.json` files are parsed as JSON; everything else as YAML.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let config: RuntimeConfig = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    config.validate()?;
    tracing::info!(path = %path.display(), servers = config.servers.len(), "config loaded");
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`; unset variables without a default are empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLHOST_TEST_UNSET__");
        assert_eq!(interpolate_env_vars("${__TOOLHOST_TEST_UNSET__:-/fallback}"), "/fallback");
        assert_eq!(interpolate_env_vars("a${__TOOLHOST_TEST_UNSET__}b"), "ab");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLHOST_TEST_SET__", "/custom");
        assert_eq!(interpolate_env_vars("${__TOOLHOST_TEST_SET__:-/fallback}/x"), "/custom/x");
        std::env::remove_var("__TOOLHOST_TEST_SET__");
    }

    #[test]
    fn test_interpolate_leaves_plain_dollars() {
        let input = "cost: $5 and $HOME";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/servers"));
        assert_eq!(expand_tilde("/abs"), "/abs");
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.transport.request_timeout_ms, 30_000);
        assert_eq!(config.transport.shutdown_grace_ms, 5_000);
        assert_eq!(config.executor.timeout_ms, 30_000);
        assert_eq!(config.discovery.min_success_rate, 0.3);
        assert!(config.discovery.interval_ms.is_none());
    }

    #[test]
    fn test_load_yaml_with_interpolation() {
        std::env::remove_var("__TOOLHOST_TEST_ROOT__");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolhost.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
servers:
  - id: fs
    name: Filesystem
    command: node
    args: ["${{__TOOLHOST_TEST_ROOT__:-/srv}}/fs.js"]
    env:
      LOG_LEVEL: debug
  - id: old
    command: python3
    disabled: true
executor:
  max_retries: 1
discovery:
  interval_ms: 60000
"#
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].args, vec!["/srv/fs.js"]);
        assert_eq!(config.servers[0].env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(config.executor.max_retries, 1);
        assert_eq!(config.executor.retry_delay_ms, 1_000);
        assert_eq!(config.discovery.interval_ms, Some(60_000));
        assert_eq!(config.enabled_servers().count(), 1);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolhost.json");
        std::fs::write(
            &path,
            r#"{"servers": [{"id": "echo", "command": "mcp-echo-server"}], "transport": {"request_timeout_ms": 500}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.servers[0].id, "echo");
        assert_eq!(config.transport.request_timeout_ms, 500);
        assert_eq!(config.transport.shutdown_grace_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_blanks() {
        let mut config = RuntimeConfig {
            servers: vec![ServerConfig::new("a", "node"), ServerConfig::new("a", "python3")],
            ..RuntimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(McpError::ConfigError { .. })));

        config.servers = vec![ServerConfig::new(" ", "node")];
        assert!(config.validate().is_err());

        config.servers = vec![ServerConfig::new("a", "")];
        assert!(config.validate().is_err());

        config.servers = vec![ServerConfig::new("a", "node")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolhost.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(&path), Err(McpError::ConfigError { .. })));
        assert!(load_config(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a/toolhost.yaml"), "servers: []").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join("a/toolhost.yaml"));
    }
}
