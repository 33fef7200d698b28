//! Line-oriented front end: inbound calls as JSON lines, one response line
//! per call.
//!
//! Calls are dispatched concurrently onto the shared [`McpSession`]; the
//! output writer is serialized so response lines never interleave.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::mcp_client::types::{error_codes, BridgeResponse, Call, CorrelationId, Outcome, RpcError};
use crate::mcp_client::McpSession;

/// Turn one inbound line into a call, or the error response to send instead.
pub fn parse_inbound(line: &str) -> Result<Call, BridgeResponse> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        Outcome::Failure(RpcError::new(error_codes::PARSE_ERROR, format!("parse error: {e}")))
            .into_response(None)
    })?;

    // Recover the id (if any) so a malformed call is still answered in kind.
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<CorrelationId>(id.clone()).ok());

    let invalid = |reason: &str| {
        Outcome::Failure(RpcError::new(
            error_codes::INVALID_REQUEST,
            format!("invalid request: {reason}"),
        ))
        .into_response(id.clone())
    };

    if !value.is_object() {
        return Err(invalid("expected a JSON object"));
    }
    if id.is_none() {
        return Err(invalid("id must be an integer or a string"));
    }
    match value.get("params") {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => {}
        Some(_) => return Err(invalid("params must be an object or null")),
    }

    serde_json::from_value::<Call>(value).map_err(|e| invalid(&e.to_string()))
}

/// Serve calls from `input` until end-of-stream or `stop` resolves, then
/// wait for every in-flight call to finish. Does not shut the session down.
pub async fn serve<R, W, S>(
    session: Arc<McpSession>,
    input: R,
    output: W,
    stop: S,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
    S: Future<Output = ()>,
{
    tokio::pin!(stop);
    let output = Arc::new(Mutex::new(output));
    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    let mut served: u64 = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = &mut stop => {
                tracing::info!("stop requested, no longer reading input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        served += 1;

        match parse_inbound(&line) {
            Ok(call) => {
                let session = Arc::clone(&session);
                let output = Arc::clone(&output);
                in_flight.spawn(async move {
                    let id = call.id.clone();
                    let outcome = session.call(call).await;
                    if let Err(e) = write_response(&output, &outcome.into_response(Some(id))).await {
                        tracing::warn!(error = %e, "failed to write response");
                    }
                });
            }
            Err(response) => {
                tracing::warn!(code = ?response.error.as_ref().map(|e| e.code), "rejected inbound line");
                write_response(&output, &response).await?;
            }
        }

        // Reap finished tasks so the set does not grow without bound.
        while let Some(done) = in_flight.try_join_next() {
            if let Err(e) = done {
                tracing::error!(error = %e, "call task failed");
            }
        }
    }

    tracing::info!(pending = in_flight.len(), "waiting for in-flight calls");
    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "call task failed");
        }
    }
    Ok(served)
}

async fn write_response<W>(output: &Mutex<W>, response: &BridgeResponse) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    let mut out = output.lock().await;
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    #[test]
    fn test_parse_inbound_call() {
        let call = parse_inbound(r#"{"method":"tools/list","params":{},"id":1}"#).unwrap();
        assert_eq!(call.method, "tools/list");
        assert_eq!(call.id, CorrelationId::Number(1));
    }

    #[test]
    fn test_parse_inbound_malformed_json() {
        let resp = parse_inbound("{not json").unwrap_err();
        assert!(resp.id.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::PARSE_ERROR);
    }

    #[test]
    fn test_parse_inbound_bad_params_keeps_id() {
        let resp = parse_inbound(r#"{"method":"tools/call","params":[1,2],"id":"x"}"#).unwrap_err();
        assert_eq!(resp.id, Some(CorrelationId::Text("x".into())));
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_parse_inbound_missing_method_or_id() {
        let resp = parse_inbound(r#"{"params":{},"id":4}"#).unwrap_err();
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
        let resp = parse_inbound(r#"{"method":"tools/list"}"#).unwrap_err();
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serve_round_trip() {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([^,}]*\).*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
done
"#;
        let session = Arc::new(McpSession::new(BridgeConfig {
            name: "mock".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            settle_delay_ms: 0,
            shutdown_grace_ms: 1_000,
            ..BridgeConfig::default()
        }));

        let input = b"{\"method\":\"tools/list\",\"params\":{},\"id\":1}\n\
                      garbage\n\
                      {\"method\":\"tools/list\",\"id\":\"two\"}\n";
        let (writer, reader) = tokio::io::duplex(8192);

        let served = serve(Arc::clone(&session), &input[..], writer, std::future::pending())
            .await
            .unwrap();
        assert_eq!(served, 3);
        session.shutdown().await;

        let mut lines = BufReader::new(reader).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
        }
        assert_eq!(responses.len(), 3);

        let parse_error = responses.iter().find(|r| r.get("error").is_some()).unwrap();
        assert_eq!(parse_error["error"]["code"], error_codes::PARSE_ERROR);
        assert!(parse_error["id"].is_null());

        for id in [serde_json::json!(1), serde_json::json!("two")] {
            let resp = responses.iter().find(|r| r["id"] == id).unwrap();
            assert_eq!(resp["result"], serde_json::json!({"tools": []}));
        }
    }
}
