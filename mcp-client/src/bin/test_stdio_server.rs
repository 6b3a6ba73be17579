//! A tiny MCP server over stdio, used by the integration tests.
//!
//! Speaks just enough of the protocol to exercise the client: `initialize`,
//! `tools/list` (two tools across two pages), `tools/call` for `echo` and
//! `add`, and a `notifications/message` emitted right after initialization.

use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: JSONRPCMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };
        match message {
            JSONRPCMessage::Request(request) => {
                let reply = handle_request(&request);
                write_message(&mut stdout, &JSONRPCMessage::Response(reply)).await?;
            }
            JSONRPCMessage::Notification(notification)
                if notification.method == "notifications/initialized" =>
            {
                let note = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": "notifications/message",
                    "params": { "level": "info", "data": "ready" }
                });
                let note: JSONRPCMessage = serde_json::from_value(note)?;
                write_message(&mut stdout, &note).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn handle_request(request: &JSONRPCRequest) -> JSONRPCResponse {
    let params = request.params.clone().unwrap_or(Value::Null);
    let result = match request.method.as_str() {
        "initialize" => json!({
            "capabilities": { "tools": { "listChanged": true } },
            "protocolVersion": params["protocolVersion"],
            "serverInfo": { "name": "test-stdio-server", "version": "0.0.0" }
        }),
        "tools/list" => match params["cursor"].as_str() {
            None => json!({
                "tools": [ { "name": "echo", "inputSchema": { "type": "object" } } ],
                "nextCursor": "p2"
            }),
            Some("p2") => json!({
                "tools": [ { "name": "add", "inputSchema": { "type": "object" } } ]
            }),
            Some(_) => json!({ "tools": [] }),
        },
        "tools/call" => {
            let arguments = &params["arguments"];
            match params["name"].as_str() {
                Some("echo") => json!({
                    "content": [ { "type": "text", "text": arguments["text"] } ]
                }),
                Some("add") => {
                    let sum = arguments["x"].as_i64().unwrap_or(0)
                        + arguments["y"].as_i64().unwrap_or(0);
                    json!({
                        "content": [ { "type": "text", "text": sum.to_string() } ]
                    })
                }
                _ => json!({
                    "content": [ { "type": "text", "text": "unknown tool" } ],
                    "isError": true
                }),
            }
        }
        _ => json!({}),
    };
    JSONRPCResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: request.id.clone(),
        result,
    }
}

async fn write_message(
    stdout: &mut tokio::io::Stdout,
    message: &JSONRPCMessage,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
