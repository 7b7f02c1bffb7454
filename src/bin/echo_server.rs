//! `mcp-echo-server`: a minimal MCP tool server over stdio.
//!
//! Advertises a single `echo` tool that repeats its `message` argument.
//! Used as a known-good server in integration tests and for local smoke tests.

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use toolhost::logging::{init_tracing, LogOptions};
use toolhost::mcp_client::framing::LineBuffer;
use toolhost::mcp_client::types::{error_codes, JsonRpcError, JsonRpcMessage, RequestId, PROTOCOL_VERSION};

/// Upper bound on `repeat` so a bad argument cannot exhaust memory.
const MAX_REPEAT: u64 = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogOptions::default());

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];

    tracing::info!(pid = std::process::id(), "echo server ready");

    loop {
        let n = stdin.read(&mut chunk).await.context("reading stdin")?;
        if n == 0 {
            break;
        }
        buffer.extend(&chunk[..n]);

        while let Some(line) = buffer.next_line() {
            let Some(reply) = handle_line(&line) else {
                continue;
            };
            let encoded = reply.to_line().context("encoding response")?;
            stdout.write_all(encoded.as_bytes()).await.context("writing stdout")?;
            stdout.flush().await.context("flushing stdout")?;
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

/// Answer one inbound line; notifications and unparseable lines get no reply.
fn handle_line(line: &str) -> Option<JsonRpcMessage> {
    let message = match JsonRpcMessage::parse(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed line");
            return None;
        }
    };

    match message {
        JsonRpcMessage::Request { id, method, params } => {
            tracing::debug!(%id, method = %method, "request");
            Some(match dispatch(&method, params.unwrap_or(Value::Null)) {
                Ok(result) => JsonRpcMessage::Response { id, result },
                Err(error) => JsonRpcMessage::Error { id, error },
            })
        }
        JsonRpcMessage::Notification { method, .. } => {
            tracing::debug!(method = %method, "notification");
            None
        }
        other => {
            tracing::debug!(id = ?other.id().map(RequestId::to_string), "ignoring response");
            None
        }
    }
}

fn dispatch(method: &str, params: Value) -> Result<Value, JsonRpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "mcp-echo-server",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": [{
                "name": "echo",
                "description": "Echo a message back, optionally repeated",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "message": { "type": "string", "description": "Text to echo" },
                        "repeat": { "type": "number", "description": "How many times to repeat it" }
                    },
                    "required": ["message"]
                }
            }]
        })),
        "tools/call" => Ok(call_tool(&params)),
        other => Err(JsonRpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("method not found: {other}"),
            data: None,
        }),
    }
}

fn call_tool(params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != "echo" {
        return tool_error(&format!("unknown tool: {name}"));
    }

    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    let Some(message) = args.get("message").and_then(Value::as_str) else {
        return tool_error("missing required argument 'message'");
    };
    let repeat = match args.get("repeat") {
        None | Some(Value::Null) => 1,
        Some(v) => match v.as_f64() {
            Some(n) if n >= 0.0 => (n as u64).min(MAX_REPEAT),
            _ => return tool_error("'repeat' must be a non-negative number"),
        },
    };

    json!({
        "content": [{ "type": "text", "text": message.repeat(repeat as usize) }],
        "isError": false
    })
}

fn tool_error(message: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true
    })
}
