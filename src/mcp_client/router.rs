//! Response router: the single background reader of the child's stdout.
//!
//! Decodes one JSON-RPC message per line and dispatches it:
//! - Response → the matching [`PendingTable`] entry
//! - Notification → logged and dropped
//! - Child→client request → answered on stdin (`ping` succeeds, the rest get
//!   method-not-found) so the child never waits on us
//! - Undecodable line → logged and skipped
//!
//! When stdout reaches end-of-stream the router fails every remaining
//! pending request and marks the session as exited.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::lifecycle::StateCell;
use super::pending::PendingTable;
use super::transport::{decode_line, truncate_for_log, StdioTransport};
use super::types::{error_codes, Message, Outcome, RpcError};

/// Failure message delivered to callers still waiting when stdout closes.
pub const EXITED_BEFORE_RESPONSE: &str = "server process exited before responding";

/// What the router did with one line. Returned for tests and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Resolved,
    Stale,
    Notification,
    AnsweredRequest,
    Unattributed,
    Undecodable,
    Blank,
}

/// Everything the router needs, shared with the owning session.
#[derive(Clone)]
pub struct RouterContext {
    pub server: String,
    pub pending: Arc<PendingTable>,
    pub transport: Arc<StdioTransport>,
    pub state: Arc<StateCell>,
}

/// Start the reader loop over `stdout`.
pub fn spawn_router<R>(stdout: R, ctx: RouterContext) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(run_router(stdout, ctx))
}

async fn run_router<R>(stdout: R, ctx: RouterContext)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut routed: u64 = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Lossy decoding keeps one bad byte sequence from ending the loop.
                let line = String::from_utf8_lossy(&buf);
                if route_line(&ctx, &line).await == RouteAction::Resolved {
                    routed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(server = %ctx.server, error = %e, "failed to read server stdout");
                break;
            }
        }
    }

    // State first, so a caller woken by `fail_all` already sees the exit.
    if ctx.state.mark_exiting() {
        ctx.transport.close().await;
        ctx.state.finish_exit();
    }
    let failed = ctx.pending.fail_all(EXITED_BEFORE_RESPONSE);
    tracing::info!(
        server = %ctx.server,
        routed,
        failed_pending = failed,
        "server stdout closed, router stopped"
    );
}

/// Decode and dispatch a single stdout line.
pub async fn route_line(ctx: &RouterContext, line: &str) -> RouteAction {
    if line.trim().is_empty() {
        return RouteAction::Blank;
    }

    let message = match decode_line(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(server = %ctx.server, error = %e, "skipping undecodable line from server");
            return RouteAction::Undecodable;
        }
    };

    match message {
        Message::Response { id, outcome } => {
            if ctx.pending.resolve(&id, outcome) {
                RouteAction::Resolved
            } else {
                RouteAction::Stale
            }
        }
        Message::Notification { method, .. } => {
            tracing::debug!(server = %ctx.server, method = %method, "server notification");
            RouteAction::Notification
        }
        Message::Request { id, method, .. } => {
            let outcome = if method == "ping" {
                Outcome::Result(serde_json::json!({}))
            } else {
                tracing::debug!(server = %ctx.server, id = %id, method = %method, "rejecting server request");
                Outcome::Failure(RpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                ))
            };
            if let Err(e) = ctx.transport.reply(id, outcome).await {
                tracing::warn!(server = %ctx.server, error = %e, "failed to answer server request");
            }
            RouteAction::AnsweredRequest
        }
        Message::Unattributed { error } => {
            tracing::warn!(
                server = %ctx.server,
                code = ?error.as_ref().map(|e| e.code),
                message = ?error.as_ref().map(|e| truncate_for_log(&e.message)),
                "server sent a response without an id"
            );
            RouteAction::Unattributed
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::mcp_client::types::{CorrelationId, SessionState};

    /// Router context over in-memory pipes. Returns the child-side stdin
    /// reader so tests can see replies.
    fn context() -> (RouterContext, DuplexStream) {
        let (stdin_writer, stdin_reader) = tokio::io::duplex(4096);
        let ctx = RouterContext {
            server: "test".into(),
            pending: Arc::new(PendingTable::new()),
            transport: Arc::new(StdioTransport::new("test", stdin_writer)),
            state: Arc::new(StateCell::new("test")),
        };
        (ctx, stdin_reader)
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let (ctx, _stdin) = context();
        let pending = ctx.pending.register(1i64.into(), "tools/list").unwrap();

        let action = route_line(&ctx, r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).await;
        assert_eq!(action, RouteAction::Resolved);

        let outcome = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Some(Outcome::Result(serde_json::json!({"tools": []}))));
    }

    #[tokio::test]
    async fn test_malformed_error_object_still_resolves() {
        let (ctx, _stdin) = context();
        let pending = ctx.pending.register(3i64.into(), "tools/call").unwrap();

        let action = route_line(&ctx, r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000}}"#).await;
        assert_eq!(action, RouteAction::Resolved);
        assert!(!ctx.pending.contains(&3i64.into()));

        let Some(Outcome::Failure(err)) = pending.wait(Duration::from_millis(100)).await.unwrap() else {
            panic!("expected failure outcome");
        };
        assert_eq!(err.code, -32000);
        assert_eq!(err.data, Some(serde_json::json!({"code": -32000})));
    }

    #[tokio::test]
    async fn test_unknown_id_is_stale() {
        let (ctx, _stdin) = context();
        let action = route_line(&ctx, r#"{"jsonrpc":"2.0","id":42,"result":{}}"#).await;
        assert_eq!(action, RouteAction::Stale);
    }

    #[tokio::test]
    async fn test_garbage_and_blank_lines() {
        let (ctx, _stdin) = context();
        assert_eq!(route_line(&ctx, "GitHub MCP Server running on stdio").await, RouteAction::Undecodable);
        assert_eq!(route_line(&ctx, "   \n").await, RouteAction::Blank);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (ctx, stdin) = context();
        let action = route_line(&ctx, r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).await;
        assert_eq!(action, RouteAction::AnsweredRequest);

        let mut lines = tokio::io::BufReader::new(stdin).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_unknown_server_request_rejected() {
        let (ctx, stdin) = context();
        route_line(&ctx, r#"{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage"}"#).await;

        let mut lines = tokio::io::BufReader::new(stdin).lines();
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_survives_bad_lines_and_fails_pending_on_eof() {
        let (ctx, mut stdin) = context();
        ctx.state.set(SessionState::Ready);
        let answered = ctx.pending.register(2i64.into(), "tools/list").unwrap();
        let orphaned = ctx.pending.register("late".into(), "tools/call").unwrap();

        let (mut child_stdout, router_input) = tokio::io::duplex(4096);
        let handle = spawn_router(router_input, ctx.clone());

        child_stdout.write_all(b"not json at all\n").await.unwrap();
        child_stdout.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        child_stdout
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
            .await
            .unwrap();
        child_stdout
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"error\":{\"code\":-32601,\"message\":\"method not found\"}}\n")
            .await
            .unwrap();

        let outcome = answered.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            outcome,
            Some(Outcome::Failure(RpcError::new(-32601, "method not found")))
        );

        drop(child_stdout);
        handle.await.unwrap();

        let Some(Outcome::Failure(err)) = orphaned.wait(Duration::from_secs(1)).await.unwrap() else {
            panic!("expected failure for orphaned request");
        };
        assert_eq!(err.message, EXITED_BEFORE_RESPONSE);
        assert!(ctx.pending.is_empty());
        assert!(!ctx.pending.contains(&CorrelationId::Text("late".into())));
        assert_eq!(ctx.state.get(), SessionState::Terminated);

        // The dead process's stdin was released on the way to Terminated.
        let mut leftover = Vec::new();
        stdin.read_to_end(&mut leftover).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_eof_during_shutdown_leaves_state_to_shutdown() {
        let (ctx, _stdin) = context();
        ctx.state.set(SessionState::Terminating);

        let (child_stdout, router_input) = tokio::io::duplex(64);
        let handle = spawn_router(router_input, ctx.clone());
        drop(child_stdout);
        handle.await.unwrap();

        assert_eq!(ctx.state.get(), SessionState::Terminating);
    }
}
