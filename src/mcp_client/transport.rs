//! Line-delimited JSON-RPC codec and the stdin writer.
//!
//! Handles the byte-level side of talking to an MCP child process:
//! - Encoding calls and notifications as one JSON object per line
//! - Decoding a line from stdout into a classified [`Message`]
//! - Serializing writes so concurrent callers never interleave two lines

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, Call, CorrelationId, Message, Outcome, RawMessage, RpcError};

/// Longest slice of an undecodable line kept in errors and logs.
const MAX_LOGGED_LINE: usize = 200;

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Outgoing request or notification. Field order is the wire order.
#[derive(serde::Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a CorrelationId>,
}

/// Encode a call as a single newline-terminated JSON line.
///
/// Missing params are sent as `{}`.
pub fn encode_call(call: &Call) -> Result<Vec<u8>, serde_json::Error> {
    let empty = serde_json::Value::Object(serde_json::Map::new());
    let envelope = Envelope {
        jsonrpc: "2.0",
        method: &call.method,
        params: Some(call.params.as_ref().unwrap_or(&empty)),
        id: Some(&call.id),
    };
    to_line(&envelope)
}

/// Encode a notification. The `id` field is omitted entirely.
pub fn encode_notification(
    method: &str,
    params: Option<&serde_json::Value>,
) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = Envelope {
        jsonrpc: "2.0",
        method,
        params,
        id: None,
    };
    to_line(&envelope)
}

/// Encode our answer to a request the child sent us.
pub fn encode_reply(id: CorrelationId, outcome: Outcome) -> Result<Vec<u8>, serde_json::Error> {
    to_line(&outcome.into_response(Some(id)))
}

/// Compact serde_json output escapes control characters, so the only raw
/// newline in the buffer is the terminator appended here.
fn to_line<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode one line read from the child's stdout.
pub fn decode_line(line: &str) -> Result<Message, McpError> {
    let trimmed = line.trim();

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| decode_error(trimmed, e.to_string()))?;
    if !value.is_object() {
        return Err(decode_error(trimmed, "expected a JSON object".into()));
    }

    let raw: RawMessage =
        serde_json::from_value(value).map_err(|e| decode_error(trimmed, e.to_string()))?;

    let message = match (raw.id, raw.method) {
        (Some(id), Some(method)) => Message::Request {
            id,
            method,
            params: raw.params,
        },
        (None, Some(method)) => Message::Notification {
            method,
            params: raw.params,
        },
        (Some(id), None) => {
            let outcome = match (raw.error, raw.result) {
                (Some(err), _) => Outcome::Failure(RpcError::from_wire(err)),
                (None, Some(result)) => Outcome::Result(result),
                (None, None) => Outcome::Failure(RpcError::new(
                    error_codes::INTERNAL_ERROR,
                    "response missing both result and error",
                )),
            };
            Message::Response { id, outcome }
        }
        (None, None) => Message::Unattributed {
            error: raw.error.map(RpcError::from_wire),
        },
    };

    Ok(message)
}

fn decode_error(line: &str, reason: String) -> McpError {
    McpError::Decode {
        line: truncate_for_log(line),
        reason,
    }
}

/// Shorten a line for logging, respecting char boundaries.
pub(crate) fn truncate_for_log(line: &str) -> String {
    if line.len() <= MAX_LOGGED_LINE {
        return line.to_string();
    }
    let mut end = MAX_LOGGED_LINE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &line[..end])
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the JSON-RPC channel to a child process.
///
/// The writer sits behind an async mutex held for encode+write+flush of a
/// single line. Reading is owned by the response router, not by this type.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
}

impl StdioTransport {
    /// Create a transport over the child's stdin (or any writer in tests).
    pub fn new<W>(server_name: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
        }
    }

    /// Write a call to the child.
    pub async fn send_call(&self, call: &Call) -> Result<(), McpError> {
        let line = encode_call(call).map_err(|e| self.transport_error("serialize request", e))?;
        tracing::trace!(server = %self.server_name, id = %call.id, method = %call.method, "sending request");
        self.write_line(&line).await
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let line = encode_notification(method, params.as_ref())
            .map_err(|e| self.transport_error("serialize notification", e))?;
        tracing::trace!(server = %self.server_name, method, "sending notification");
        self.write_line(&line).await
    }

    /// Answer a request the child sent us.
    pub async fn reply(&self, id: CorrelationId, outcome: Outcome) -> Result<(), McpError> {
        let line = encode_reply(id, outcome).map_err(|e| self.transport_error("serialize reply", e))?;
        self.write_line(&line).await
    }

    /// Close stdin. Most stdio servers treat EOF as a request to exit.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            if let Err(e) = w.shutdown().await {
                tracing::debug!(server = %self.server_name, error = %e, "closing stdin failed");
            }
        }
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(line)
            .await
            .map_err(|e| self.transport_error("write to stdin", e))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error("flush stdin", e))?;

        Ok(())
    }

    fn transport_error(&self, what: &str, e: impl std::fmt::Display) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to {what}: {e}"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_encode_call_shape() {
        let call = Call::new("tools/list", Some(serde_json::json!({})), 1i64);
        let line = encode_call(&call).unwrap();
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "{\"jsonrpc\":\"2.0\",\"method\":\"tools/list\",\"params\":{},\"id\":1}\n"
        );
    }

    #[test]
    fn test_encode_call_defaults_params_to_empty_object() {
        let call = Call::new("tools/list", None, "abc");
        let line = String::from_utf8(encode_call(&call).unwrap()).unwrap();
        assert!(line.contains(r#""params":{}"#));
        assert!(line.contains(r#""id":"abc""#));
    }

    #[test]
    fn test_encode_notification_omits_id() {
        let line = encode_notification("notifications/initialized", None).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(!text.contains("params"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_encoded_line_has_single_newline() {
        let params = serde_json::json!({"body": "line one\nline two\r\n"});
        let call = Call::new("issues/create", Some(params), 5i64);
        let line = encode_call(&call).unwrap();
        let newlines = line.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn test_decode_result_response() {
        let msg = decode_line(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: CorrelationId::Number(1),
                outcome: Outcome::Result(serde_json::json!({"tools": []})),
            }
        );
    }

    #[test]
    fn test_decode_error_response() {
        let msg = decode_line(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        let Message::Response { id, outcome } = msg else {
            panic!("expected response");
        };
        assert_eq!(id, CorrelationId::Number(2));
        assert_eq!(
            outcome,
            Outcome::Failure(RpcError::new(-32601, "method not found"))
        );
    }

    #[test]
    fn test_decode_response_missing_both() {
        let msg = decode_line(r#"{"jsonrpc":"2.0","id":"x"}"#).unwrap();
        let Message::Response { outcome, .. } = msg else {
            panic!("expected response");
        };
        let Outcome::Failure(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_decode_nonstandard_error_is_still_a_response() {
        let msg = decode_line(r#"{"jsonrpc":"2.0","id":3,"error":"boom"}"#).unwrap();
        let Message::Response { id, outcome } = msg else {
            panic!("expected response");
        };
        assert_eq!(id, CorrelationId::Number(3));
        let Outcome::Failure(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_decode_notification() {
        let msg = decode_line(
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, Message::Notification { ref method, .. } if method == "notifications/message"));
    }

    #[test]
    fn test_decode_server_request() {
        let msg = decode_line(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Request { ref method, .. } if method == "ping"));
    }

    #[test]
    fn test_decode_null_id_error() {
        let msg = decode_line(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        let Message::Unattributed { error } = msg else {
            panic!("expected unattributed");
        };
        assert_eq!(error.unwrap().code, -32700);
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode_line("starting github-mcp-server on stdio").unwrap_err();
        assert!(matches!(err, McpError::Decode { .. }));
    }

    #[test]
    fn test_decode_non_object() {
        let err = decode_line("[1,2,3]").unwrap_err();
        assert!(matches!(err, McpError::Decode { ref reason, .. } if reason.contains("object")));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundary() {
        let long = "é".repeat(300);
        let out = truncate_for_log(&long);
        assert!(out.ends_with("...(truncated)"));
        assert!(out.len() < long.len());
    }

    #[tokio::test]
    async fn test_transport_writes_whole_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let transport = StdioTransport::new("test", client);

        transport
            .send_call(&Call::new("tools/list", None, 1i64))
            .await
            .unwrap();
        transport.notify("notifications/initialized", None).await.unwrap();

        let mut lines = BufReader::new(server).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains(r#""id":1"#));
        assert!(second.contains("notifications/initialized"));
    }

    #[tokio::test]
    async fn test_transport_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let transport = StdioTransport::new("test", client);
        transport.close().await;

        let err = transport
            .send_call(&Call::new("tools/list", None, 1i64))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }
}
