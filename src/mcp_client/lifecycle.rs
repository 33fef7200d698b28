//! Child process lifecycle management.
//!
//! Spawns the MCP server with an explicit environment, hands its three stdio
//! streams to the rest of the session, drains stderr into the log, and tears
//! the process down with a graceful-then-forceful shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::SessionState;
use crate::config::BridgeConfig;

/// Number of stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// A freshly spawned child with its stdio streams split off.
pub struct SpawnedChild {
    pub process: ChildProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Spawn the configured MCP server.
///
/// The inherited environment is cleared: only the variables named in
/// `inherit_env` plus the explicit `env` map reach the child. Values are
/// never logged, only names.
pub fn spawn_child(name: &str, config: &BridgeConfig) -> Result<SpawnedChild, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    cmd.env_clear();
    for key in &config.inherit_env {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", config.command),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::info!(
        server = name,
        pid,
        command = %config.command,
        args = ?config.args,
        env_keys = ?config.env.keys().collect::<Vec<_>>(),
        "spawned MCP server process"
    );

    Ok(SpawnedChild {
        process: ChildProcess {
            name: name.to_string(),
            child,
            pid,
        },
        stdin,
        stdout,
        stderr,
    })
}

// ─── ChildProcess ────────────────────────────────────────────────────────────

/// How a terminated child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process had already exited before shutdown began.
    AlreadyExited(Option<i32>),
    /// The process exited within the grace period.
    Graceful(Option<i32>),
    /// The grace period elapsed and the process was killed.
    Killed,
}

/// Phases of the two-step shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    RequestExit,
    AwaitExit,
    ForceKill,
}

/// The owned child process handle.
pub struct ChildProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still running. Reaps it if it has exited, so
    /// a later `terminate` reports `AlreadyExited`.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the process and wait for it to be reaped.
    ///
    /// Sends SIGTERM (Unix), waits up to `grace`, then kills. Never returns
    /// before the process has exited. Callers close stdin first.
    pub async fn terminate(&mut self, grace: Duration) -> TerminationOutcome {
        let mut phase = ShutdownPhase::RequestExit;
        loop {
            phase = match phase {
                ShutdownPhase::RequestExit => {
                    if let Ok(Some(status)) = self.child.try_wait() {
                        return TerminationOutcome::AlreadyExited(status.code());
                    }
                    self.request_exit();
                    ShutdownPhase::AwaitExit
                }
                ShutdownPhase::AwaitExit => {
                    match tokio::time::timeout(grace, self.child.wait()).await {
                        Ok(Ok(status)) => {
                            tracing::info!(server = %self.name, pid = self.pid, code = ?status.code(), "server exited");
                            return TerminationOutcome::Graceful(status.code());
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(server = %self.name, error = %e, "waiting for server exit failed");
                            ShutdownPhase::ForceKill
                        }
                        Err(_) => {
                            tracing::warn!(
                                server = %self.name,
                                pid = self.pid,
                                grace_ms = grace.as_millis() as u64,
                                "server did not exit in time, killing"
                            );
                            ShutdownPhase::ForceKill
                        }
                    }
                }
                ShutdownPhase::ForceKill => {
                    // `kill` sends SIGKILL and then awaits the exit status.
                    if let Err(e) = self.child.kill().await {
                        tracing::warn!(server = %self.name, error = %e, "force kill failed");
                    }
                    return TerminationOutcome::Killed;
                }
            };
        }
    }

    #[cfg(unix)]
    fn request_exit(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        tracing::debug!(server = %self.name, pid, "sending SIGTERM");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(server = %self.name, pid, error = %e, "failed to send SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&self) {
        // No portable graceful signal; closing stdin is the request.
    }
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Shared, synchronously readable session state.
///
/// Written by the session on start/shutdown and by the response router when
/// the child closes stdout.
#[derive(Debug)]
pub struct StateCell {
    name: String,
    state: Mutex<SessionState>,
}

impl StateCell {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SessionState::NotStarted),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        if current != next {
            tracing::debug!(server = %self.name, from = %current, to = %next, "session state change");
            *state = next;
        }
    }

    /// Move to `to` only if the state is still `from`.
    pub fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return false;
        }
        tracing::debug!(server = %self.name, from = %from, to = %to, "session state change");
        *state = to;
        true
    }

    /// Begin recording an unexpected exit: `Starting`/`Ready` → `Terminating`.
    ///
    /// Returns `false` (and changes nothing) when the session was not running,
    /// which includes an explicit shutdown already in progress. The caller
    /// releases what is left of the dead process and then calls
    /// [`StateCell::finish_exit`].
    pub fn mark_exiting(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        match current {
            SessionState::Starting | SessionState::Ready => {
                tracing::warn!(server = %self.name, from = %current, "server process exited unexpectedly");
                *state = SessionState::Terminating;
                true
            }
            _ => false,
        }
    }

    /// `Terminating` → `Terminated`, unless something else moved the state on.
    pub fn finish_exit(&self) -> bool {
        self.advance(SessionState::Terminating, SessionState::Terminated)
    }
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Bounded tail of the child's stderr, kept for failure messages.
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The retained lines joined with newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Drain stderr to the log. Stderr is never parsed for protocol content.
pub fn spawn_stderr_drain(
    name: &str,
    stderr: ChildStderr,
    tail: Arc<StderrTail>,
) -> JoinHandle<()> {
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %name, stderr = %line, "server stderr");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %name, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
