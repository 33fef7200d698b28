//! MCP session error types.
//!
//! Every failure the core can generate on its own is a variant here. At the
//! call boundary each one is folded into the same JSON-RPC error shape the
//! child uses, so callers only tell them apart by code.

use thiserror::Error;

use super::types::{error_codes, CorrelationId, Outcome, RpcError};

/// Errors that can occur while driving an MCP child session.
#[derive(Debug, Error)]
pub enum McpError {
    /// The child process could not be launched.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialize/initialized exchange failed or timed out.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// One line from the child was not a JSON-RPC message.
    #[error("failed to decode message: {reason}")]
    Decode {
        line: String,
        reason: String,
    },

    /// The caller reused a correlation id that is still in flight.
    #[error("request id {id} is already pending")]
    DuplicateId {
        id: CorrelationId,
    },

    /// The caller used the id reserved for the handshake.
    #[error("request id {id} is reserved")]
    ReservedId {
        id: CorrelationId,
    },

    /// No response arrived before the call's deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// Writing to the child's stdin failed.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The child closed its stdout (usually because it exited).
    #[error("server '{name}' exited: {reason}")]
    ProcessExited {
        name: String,
        reason: String,
    },

    /// `shutdown()` was called; the session no longer accepts calls.
    #[error("session for server '{name}' is shut down")]
    SessionClosed {
        name: String,
    },

    /// Too many consecutive start attempts failed.
    #[error("server '{name}' failed after {attempts} start attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },

    /// Configuration error (missing variable, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// JSON-RPC error code used when this error is reported to a caller.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Decode { .. } => error_codes::PARSE_ERROR,
            McpError::DuplicateId { .. } | McpError::ReservedId { .. } => {
                error_codes::INVALID_REQUEST
            }
            McpError::Timeout { .. } => error_codes::REQUEST_TIMEOUT,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Fold this error into a call outcome.
    pub fn into_outcome(self) -> Outcome {
        let code = self.code();
        let error = match self {
            McpError::Timeout { timeout_ms, .. } => RpcError {
                code,
                message: "request timeout".into(),
                data: Some(serde_json::json!({ "timeout_ms": timeout_ms })),
            },
            other => RpcError {
                code,
                message: other.to_string(),
                data: None,
            },
        };
        Outcome::Failure(error)
    }
}
