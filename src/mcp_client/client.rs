//! MCP session: the call facade over one persistent child process.
//!
//! The first call spawns the server, starts the response router and runs the
//! handshake. Later calls reuse the same process and are multiplexed onto its
//! stdin; responses are matched back by correlation id.
//!
//! Restart policy: if the child exits on its own (or a handshake fails), the
//! next call spawns a fresh process, one attempt per call. After
//! `max_restart_attempts` consecutive failed starts the session fails fast
//! until [`McpSession::restart`] is called. A command that cannot be launched
//! at all is not retried: every call fails with `SpawnFailed` until
//! `restart`. After [`McpSession::shutdown`] every call fails with
//! `SessionClosed`, also until `restart`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::handshake::{self, initialize_id, HandshakeParams};
use super::lifecycle::{
    format_stderr_suffix, spawn_child, spawn_stderr_drain, ChildProcess, StateCell, StderrTail,
    TerminationOutcome,
};
use super::pending::PendingTable;
use super::router::{spawn_router, RouterContext, EXITED_BEFORE_RESPONSE};
use super::transport::StdioTransport;
use super::types::{Call, InitializeResult, Outcome, SessionState};
use crate::config::BridgeConfig;

/// How long teardown waits for the router and stderr drain to see EOF.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure delivered to callers still waiting when the session is torn down.
const SESSION_SHUT_DOWN: &str = "session shut down before the server responded";

// ─── LiveSession ─────────────────────────────────────────────────────────────

/// Everything tied to one spawned process. Replaced wholesale on respawn so a
/// dying process can never resolve calls meant for its successor.
struct LiveSession {
    transport: Arc<StdioTransport>,
    pending: Arc<PendingTable>,
    process: ChildProcess,
    router: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl LiveSession {
    fn handles(&self) -> (Arc<StdioTransport>, Arc<PendingTable>) {
        (Arc::clone(&self.transport), Arc::clone(&self.pending))
    }

    /// Router and stderr drain tasks that have not finished yet.
    fn running_tasks(&self) -> usize {
        std::iter::once(&self.router)
            .chain(self.stderr_task.as_ref())
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Close stdin, stop the process, then wait for the reader tasks to drain.
    async fn teardown(&mut self, grace: Duration) -> TerminationOutcome {
        self.transport.close().await;
        let outcome = self.process.terminate(grace).await;

        drain_task(&mut self.router).await;
        if let Some(task) = self.stderr_task.as_mut() {
            drain_task(task).await;
        }

        let failed = self.pending.fail_all(SESSION_SHUT_DOWN);
        if failed > 0 {
            tracing::debug!(failed, "failed in-flight requests during teardown");
        }
        outcome
    }
}

/// Wait for a reader task to see EOF; abort it if it takes too long.
async fn drain_task(task: &mut JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut *task).await.is_err() {
        task.abort();
        // Resolves once the aborted task has been dropped.
        let _ = (&mut *task).await;
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.router.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Point-in-time view of the session, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub session_id: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub in_flight: usize,
    pub oldest_in_flight_ms: Option<u64>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    /// Why the command could not be launched, while calls fail fast on it.
    pub spawn_error: Option<String>,
    /// Reader tasks (router, stderr drain) still running. Zero once the
    /// server has been torn down.
    pub background_tasks: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
}

// ─── McpSession ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionInner {
    live: Option<LiveSession>,
    /// Set by `shutdown`, cleared by `restart`.
    closed: bool,
    /// Set when the command could not be launched, cleared by `restart`.
    spawn_error: Option<String>,
    consecutive_failures: u32,
    /// Reader tasks left running by the last teardown.
    lingering_tasks: usize,
    restart_count: u32,
    started_at: Option<DateTime<Utc>>,
    init: Option<InitializeResult>,
}

/// A persistent session with one MCP server over stdio.
pub struct McpSession {
    name: String,
    session_id: uuid::Uuid,
    config: BridgeConfig,
    state: Arc<StateCell>,
    stderr_tail: Arc<StderrTail>,
    /// Held across start and teardown so those never overlap. Calls only
    /// hold it long enough to fetch the live transport.
    inner: tokio::sync::Mutex<SessionInner>,
}

impl McpSession {
    pub fn new(config: BridgeConfig) -> Self {
        let name = config.name.clone();
        Self {
            state: Arc::new(StateCell::new(&name)),
            stderr_tail: Arc::new(StderrTail::new()),
            session_id: uuid::Uuid::new_v4(),
            name,
            config,
            inner: tokio::sync::Mutex::new(SessionInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Issue one call and wait for its outcome.
    ///
    /// Never hangs: every path ends in the child's result or error, or in a
    /// bridge-generated failure (startup, duplicate id, timeout, exit).
    pub async fn call(&self, call: Call) -> Outcome {
        let method = call.method.clone();
        let id = call.id.clone();
        match self.try_call(call).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(server = %self.name, id = %id, method = %method, error = %e, "call failed");
                e.into_outcome()
            }
        }
    }

    async fn try_call(&self, call: Call) -> Result<Outcome, McpError> {
        if call.id == initialize_id() {
            return Err(McpError::ReservedId { id: call.id });
        }

        let (transport, pending) = self.ensure_ready(false).await?;

        // Registered before writing: a duplicate never reaches the wire, and
        // a fast response always finds its entry.
        let waiter = pending.register(call.id.clone(), &call.method)?;
        transport.send_call(&call).await?;

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        match waiter.wait(timeout).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(McpError::ProcessExited {
                name: self.name.clone(),
                reason: format!(
                    "{EXITED_BEFORE_RESPONSE}{}",
                    format_stderr_suffix(&self.stderr_tail.snapshot())
                ),
            }),
            Err(_) => {
                tracing::warn!(
                    server = %self.name,
                    id = %call.id,
                    method = %call.method,
                    timeout_ms = self.config.call_timeout_ms,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: call.method,
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the server now instead of on the first call.
    ///
    /// A no-op (with a warning) when the server is already running.
    pub async fn start(&self) -> Result<(), McpError> {
        self.ensure_ready(true).await.map(|_| ())
    }

    /// Tear down any running process and start a fresh one.
    ///
    /// Also reopens a session closed by `shutdown`, clears the failure
    /// counter and lets a command that failed to launch be tried again.
    pub async fn restart(&self) -> Result<(), McpError> {
        let mut inner = self.inner.lock().await;
        if let Some(live) = inner.live.take() {
            self.state.set(SessionState::Terminating);
            let outcome = self.retire(&mut inner, live).await;
            tracing::info!(server = %self.name, outcome = ?outcome, "stopped server for restart");
        }
        inner.closed = false;
        inner.spawn_error = None;
        inner.consecutive_failures = 0;
        self.start_locked(&mut inner).await.map(|_| ())
    }

    /// Stop the server and refuse further calls.
    ///
    /// Safe to call repeatedly and from failure paths. Callers still waiting
    /// receive an internal-error failure.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;

        let Some(live) = inner.live.take() else {
            self.state.set(SessionState::Terminated);
            tracing::debug!(server = %self.name, "shutdown: no running server");
            return;
        };

        self.state.set(SessionState::Terminating);
        let pid = live.process.pid();
        let outcome = self.retire(&mut inner, live).await;
        self.state.set(SessionState::Terminated);

        tracing::info!(server = %self.name, pid, outcome = ?outcome, "MCP session shut down");
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        let (pid, in_flight, oldest, background_tasks) = match inner.live.as_ref() {
            Some(live) => (
                live.process.pid(),
                live.pending.len(),
                live.pending.oldest_age().map(|d| d.as_millis() as u64),
                live.running_tasks(),
            ),
            None => (None, 0, None, inner.lingering_tasks),
        };
        let server_info = inner.init.as_ref().and_then(|i| i.server_info.as_ref());

        SessionStatus {
            name: self.name.clone(),
            session_id: self.session_id.to_string(),
            state: self.state.get(),
            pid,
            in_flight,
            oldest_in_flight_ms: oldest,
            restart_count: inner.restart_count,
            consecutive_failures: inner.consecutive_failures,
            spawn_error: inner.spawn_error.clone(),
            background_tasks,
            started_at: inner.started_at,
            server_name: server_info.and_then(|s| s.name.clone()),
            server_version: server_info.and_then(|s| s.version.clone()),
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_grace_ms)
    }

    /// Tear down a live session taken out of `inner`.
    async fn retire(&self, inner: &mut SessionInner, mut live: LiveSession) -> TerminationOutcome {
        let outcome = live.teardown(self.grace()).await;
        inner.lingering_tasks = live.running_tasks();
        if inner.lingering_tasks > 0 {
            tracing::warn!(server = %self.name, tasks = inner.lingering_tasks, "reader tasks still running after teardown");
        }
        outcome
    }

    /// Return the live transport, starting (or respawning) the server first
    /// if needed.
    async fn ensure_ready(
        &self,
        explicit: bool,
    ) -> Result<(Arc<StdioTransport>, Arc<PendingTable>), McpError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(McpError::SessionClosed {
                name: self.name.clone(),
            });
        }
        if let Some(reason) = inner.spawn_error.as_ref() {
            return Err(McpError::SpawnFailed {
                name: self.name.clone(),
                reason: format!("{reason} (not retried until restart)"),
            });
        }

        if let Some(live) = inner.live.as_mut() {
            if self.state.get() == SessionState::Ready && live.process.is_alive() {
                if explicit {
                    tracing::warn!(server = %self.name, pid = live.process.pid(), "start called while server is already running");
                }
                return Ok(live.handles());
            }
        }

        // The previous process died; reap it before spawning a new one.
        if let Some(live) = inner.live.take() {
            let outcome = self.retire(&mut inner, live).await;
            tracing::warn!(
                server = %self.name,
                outcome = ?outcome,
                "server process is gone, respawning"
            );
        }

        if inner.consecutive_failures >= self.config.max_restart_attempts {
            return Err(McpError::RestartExhausted {
                name: self.name.clone(),
                attempts: inner.consecutive_failures,
            });
        }

        self.start_locked(&mut inner).await
    }

    /// Spawn and hand-shake, recording the result in `inner`.
    async fn start_locked(
        &self,
        inner: &mut SessionInner,
    ) -> Result<(Arc<StdioTransport>, Arc<PendingTable>), McpError> {
        match self.spawn_session().await {
            Ok((live, init)) => {
                if inner.started_at.is_some() {
                    inner.restart_count += 1;
                }
                inner.consecutive_failures = 0;
                inner.started_at = Some(Utc::now());
                inner.init = Some(init);
                let handles = live.handles();
                inner.live = Some(live);
                Ok(handles)
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                if let McpError::SpawnFailed { reason, .. } = &e {
                    inner.spawn_error = Some(reason.clone());
                }
                self.state.set(SessionState::Terminated);
                tracing::error!(
                    server = %self.name,
                    attempt = inner.consecutive_failures,
                    max_attempts = self.config.max_restart_attempts,
                    error = %e,
                    "failed to start MCP server"
                );
                Err(e)
            }
        }
    }

    async fn spawn_session(&self) -> Result<(LiveSession, InitializeResult), McpError> {
        self.state.set(SessionState::Starting);
        self.stderr_tail.clear();

        let spawned = spawn_child(&self.name, &self.config)?;
        let transport = Arc::new(StdioTransport::new(&self.name, spawned.stdin));
        let pending = Arc::new(PendingTable::new());

        let router = spawn_router(
            spawned.stdout,
            RouterContext {
                server: self.name.clone(),
                pending: Arc::clone(&pending),
                transport: Arc::clone(&transport),
                state: Arc::clone(&self.state),
            },
        );
        let stderr_task = spawned
            .stderr
            .map(|stderr| spawn_stderr_drain(&self.name, stderr, Arc::clone(&self.stderr_tail)));

        let mut live = LiveSession {
            transport,
            pending,
            process: spawned.process,
            router,
            stderr_task,
        };

        let params = HandshakeParams::from(&self.config);
        let result = handshake::perform(&self.name, &live.transport, &live.pending, &params).await;

        let failure = match result {
            Ok(init) if self.state.advance(SessionState::Starting, SessionState::Ready) => {
                return Ok((live, init));
            }
            Ok(_) => McpError::HandshakeFailed {
                name: self.name.clone(),
                reason: "server exited during startup".into(),
            },
            Err(e) => e,
        };

        self.state.set(SessionState::Terminating);
        live.teardown(self.grace()).await;

        let suffix = format_stderr_suffix(&self.stderr_tail.snapshot());
        Err(match failure {
            McpError::HandshakeFailed { name, reason } => McpError::HandshakeFailed {
                name,
                reason: format!("{reason}{suffix}"),
            },
            other => other,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
