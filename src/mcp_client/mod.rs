//! MCP Client: a persistent JSON-RPC session with one stdio MCP server.
//!
//! This module handles:
//! - Spawning the server process and tearing it down (SIGTERM, then kill)
//! - Line-delimited JSON-RPC 2.0 encoding and decoding
//! - A single background router that matches responses to waiting callers
//! - The initialize/initialized handshake
//! - Lazy startup and respawn behind the `McpSession` call facade

pub mod client;
pub mod errors;
pub mod handshake;
pub mod lifecycle;
pub mod pending;
pub mod router;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{McpSession, SessionStatus};
pub use errors::McpError;
pub use types::{Call, CorrelationId, Outcome, RpcError, SessionState};
