//! MCP session handshake.
//!
//! Sends `initialize` under a reserved id, waits (bounded) for the result,
//! then sends the `notifications/initialized` notification and lets the
//! server settle before ordinary calls are allowed.

use std::sync::Arc;
use std::time::Duration;

use super::errors::McpError;
use super::pending::PendingTable;
use super::transport::StdioTransport;
use super::types::{Call, CorrelationId, InitializeResult, Outcome};
use crate::config::BridgeConfig;

/// Correlation id reserved for `initialize`; callers may not use it.
pub const INITIALIZE_ID: &str = "mcp-bridge:initialize";

/// The reserved handshake id as a [`CorrelationId`].
pub fn initialize_id() -> CorrelationId {
    CorrelationId::Text(INITIALIZE_ID.to_string())
}

/// Handshake settings derived from the bridge config.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub init_timeout: Duration,
    pub settle_delay: Duration,
}

impl From<&BridgeConfig> for HandshakeParams {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            protocol_version: config.protocol_version.clone(),
            client_name: config.client_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            init_timeout: Duration::from_millis(config.init_timeout_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        }
    }
}

/// Run initialize → initialized against a freshly spawned server.
///
/// The response router must already be reading stdout. On error the caller
/// is responsible for tearing the process down.
pub async fn perform(
    name: &str,
    transport: &StdioTransport,
    pending: &Arc<PendingTable>,
    params: &HandshakeParams,
) -> Result<InitializeResult, McpError> {
    let fail = |reason: String| McpError::HandshakeFailed {
        name: name.to_string(),
        reason,
    };

    let call = Call::new(
        "initialize",
        Some(serde_json::json!({
            "protocolVersion": params.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": params.client_name,
                "version": params.client_version,
            },
        })),
        initialize_id(),
    );

    let waiter = pending
        .register(call.id.clone(), &call.method)
        .map_err(|e| fail(e.to_string()))?;
    transport
        .send_call(&call)
        .await
        .map_err(|e| fail(e.to_string()))?;

    let outcome = match waiter.wait(params.init_timeout).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => return Err(fail("server closed before answering initialize".into())),
        Err(_) => {
            return Err(fail(format!(
                "initialize timed out after {}ms",
                params.init_timeout.as_millis()
            )))
        }
    };

    let result = match outcome {
        Outcome::Result(value) => value,
        Outcome::Failure(err) => {
            return Err(fail(format!(
                "initialize returned error [{}]: {}",
                err.code, err.message
            )))
        }
    };

    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| fail(format!("failed to parse initialize response: {e}")))?;

    if let Some(version) = init.protocol_version.as_deref() {
        if version != params.protocol_version {
            tracing::warn!(
                server = name,
                requested = %params.protocol_version,
                negotiated = version,
                "server negotiated a different protocol version"
            );
        }
    }

    transport
        .notify("notifications/initialized", None)
        .await
        .map_err(|e| fail(e.to_string()))?;

    // The server may still be wiring up internals that no response acknowledges.
    if !params.settle_delay.is_zero() {
        tokio::time::sleep(params.settle_delay).await;
    }

    let info = init.server_info.as_ref();
    tracing::info!(
        server = name,
        server_name = ?info.and_then(|i| i.name.as_deref()),
        server_version = ?info.and_then(|i| i.version.as_deref()),
        protocol = ?init.protocol_version,
        "MCP handshake complete"
    );

    Ok(init)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
