//! Shared types for the MCP session.
//!
//! JSON-RPC 2.0 message types, call outcomes and MCP handshake structures.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

// ─── Correlation ─────────────────────────────────────────────────────────────

/// JSON-RPC request id: either an integer or a string, as chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{n}"),
            CorrelationId::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(n: i64) -> Self {
        CorrelationId::Number(n)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Text(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId::Text(s)
    }
}

// ─── Calls and Outcomes ──────────────────────────────────────────────────────

/// A caller-issued request. Immutable once handed to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: CorrelationId,
}

impl Call {
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: impl Into<CorrelationId>,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Read a child-reported error leniently. A malformed error keeps its
    /// `code` if it has one (internal error otherwise) and carries the raw
    /// value in `data`.
    pub fn from_wire(raw: serde_json::Value) -> Self {
        if let Ok(err) = serde_json::from_value::<RpcError>(raw.clone()) {
            return err;
        }
        let code = raw
            .get("code")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(error_codes::INTERNAL_ERROR);
        let message = match raw.get("message").and_then(serde_json::Value::as_str) {
            Some(message) => message.to_string(),
            None => match &raw {
                serde_json::Value::String(text) => text.clone(),
                other => format!("malformed error from server: {other}"),
            },
        };
        Self {
            code,
            message,
            data: Some(raw),
        }
    }
}

/// The single result of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(serde_json::Value),
    Failure(RpcError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Result(_))
    }

    /// Wrap the outcome into the response envelope sent back to the caller.
    pub fn into_response(self, id: Option<CorrelationId>) -> BridgeResponse {
        let (result, error) = match self {
            Outcome::Result(value) => (Some(value), None),
            Outcome::Failure(err) => (None, Some(err)),
        };
        BridgeResponse {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

/// Response envelope handed to the front end.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeResponse {
    pub jsonrpc: &'static str,
    pub id: Option<CorrelationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

// ─── Decoded Messages ────────────────────────────────────────────────────────

/// A message read from the child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Reply to one of our requests.
    Response {
        id: CorrelationId,
        outcome: Outcome,
    },
    /// Fire-and-forget message from the child.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// The child is asking us something (e.g. `ping`).
    Request {
        id: CorrelationId,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// A reply with a null or missing id, typically a parse error the child
    /// could not attribute to any request.
    Unattributed {
        error: Option<RpcError>,
    },
}

/// Wire shape used to classify an incoming line.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMessage {
    #[serde(default)]
    pub id: Option<CorrelationId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub result: Option<serde_json::Value>,
    /// Kept loose so a non-standard error object still reaches its caller.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Keep `"result": null` distinct from a missing `result` field.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Lifecycle of the child session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Starting,
    Ready,
    Terminating,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::NotStarted => "not_started",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

// ─── MCP Handshake ───────────────────────────────────────────────────────────

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// No response before the call deadline (bridge extension).
    pub const REQUEST_TIMEOUT: i64 = -32001;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_accepts_int_and_string() {
        let n: CorrelationId = serde_json::from_str("42").unwrap();
        let s: CorrelationId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(n, CorrelationId::Number(42));
        assert_eq!(s, CorrelationId::Text("abc".into()));
        assert_eq!(n.to_string(), "42");
        assert_eq!(s.to_string(), "\"abc\"");
    }

    #[test]
    fn test_call_params_default_to_none() {
        let call: Call = serde_json::from_str(r#"{"method": "tools/list", "id": 1}"#).unwrap();
        assert_eq!(call.method, "tools/list");
        assert!(call.params.is_none());
        assert_eq!(call.id, CorrelationId::Number(1));
    }

    #[test]
    fn test_response_envelope_success() {
        let resp = Outcome::Result(serde_json::json!({"tools": []}))
            .into_response(Some(CorrelationId::Number(1)));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})
        );
    }

    #[test]
    fn test_response_envelope_failure_omits_result() {
        let resp = Outcome::Failure(RpcError::new(-32601, "method not found"))
            .into_response(Some("req-9".into()));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains(r#""id":"req-9""#));
        assert!(json.contains(r#""code":-32601"#));
    }

    #[test]
    fn test_raw_message_keeps_null_result() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert_eq!(raw.result, Some(serde_json::Value::Null));

        let raw: RawMessage = serde_json::from_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert!(raw.result.is_none());
    }

    #[test]
    fn test_rpc_error_from_wire_lenient() {
        let strict = RpcError::from_wire(serde_json::json!({"code": -32601, "message": "nope"}));
        assert_eq!(strict, RpcError::new(-32601, "nope"));

        let missing_message = RpcError::from_wire(serde_json::json!({"code": -32000}));
        assert_eq!(missing_message.code, -32000);
        assert_eq!(missing_message.data, Some(serde_json::json!({"code": -32000})));

        let text = RpcError::from_wire(serde_json::json!("boom"));
        assert_eq!(text.code, error_codes::INTERNAL_ERROR);
        assert_eq!(text.message, "boom");
    }

    #[test]
    fn test_initialize_result_camel_case_aliases() {
        let json = r#"{
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "github-mcp-server", "version": "0.30.3"}
        }"#;
        let init: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(init.protocol_version.as_deref(), Some("2024-11-05"));
        assert_eq!(
            init.server_info.unwrap().name.as_deref(),
            Some("github-mcp-server")
        );
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::NotStarted.to_string(), "not_started");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }
}
