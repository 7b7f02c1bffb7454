//! Server process lifecycle management.
//!
//! Spawns tool server processes with piped stdio and tears them down:
//! graceful termination first, forced kill once the grace window elapses.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// A freshly spawned server with its three pipes detached from the handle.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Build the command for a server: parent environment plus overrides,
/// optional working directory, all three streams piped.
pub fn build_command(config: &ServerConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Overrides are layered on the inherited environment.
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Spawn the server process described by `config`.
pub fn spawn_process(config: &ServerConfig) -> Result<SpawnedProcess, McpError> {
    let mut child = build_command(config)
        .spawn()
        .map_err(|e| McpError::SpawnFailed {
            server: config.id.clone(),
            reason: format!("{}: {e}", config.command),
        })?;

    let stdin = child.stdin.take().ok_or_else(|| capture_failed(config, "stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| capture_failed(config, "stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| capture_failed(config, "stderr"))?;

    Ok(SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

fn capture_failed(config: &ServerConfig, stream: &str) -> McpError {
    McpError::SpawnFailed {
        server: config.id.clone(),
        reason: format!("failed to capture {stream}"),
    }
}

// ─── Termination ─────────────────────────────────────────────────────────────

/// Stop a server process.
///
/// The caller is expected to have closed stdin already. Sends a termination
/// signal, waits up to `grace` for the process to exit, then kills it.
pub async fn terminate(child: &mut Child, grace: Duration, server: &str) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    request_termination(child, server);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => {
            tracing::warn!(server, error = %e, "failed waiting for server exit");
        }
        Err(_) => {
            tracing::warn!(
                server,
                grace_ms = grace.as_millis() as u64,
                "server did not exit within grace period, killing"
            );
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(server, error = %e, "failed to kill server process");
    }
    child.try_wait().ok().flatten()
}

#[cfg(unix)]
fn request_termination(child: &Child, server: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(server, pid, error = %e, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child, _server: &str) {
    // No graceful signal here; closing stdin is the only request to exit.
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", lines.join(" / "))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
