//! Minimal MCP stdio server used only by gateway integration tests.
//!
//! Speaks JSON-RPC over stdio directly (one JSON message per line) without
//! depending on the gateway's production code paths. Failure modes for
//! negative tests are switched on via environment variables:
//!
//! - `MCP_TEST_HANG_TOOLS_LIST=1` — answer `initialize`, then never answer
//!   `tools/list`.

use serde_json::json;
use std::io::{BufRead as _, Write};

fn main() -> anyhow::Result<()> {
    let hang_tools_list = std::env::var("MCP_TEST_HANG_TOOLS_LIST").is_ok_and(|v| v == "1");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(resp) = handle_line(&line, hang_tools_list) {
            write_json_line(&mut stdout, &resp)?;
        }
    }

    Ok(())
}

fn handle_line(line: &str, hang_tools_list: bool) -> Option<serde_json::Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg: serde_json::Value = serde_json::from_str(line).ok()?;
    let method = msg.get("method").and_then(serde_json::Value::as_str)?;

    // Ignore notifications (no `id`).
    let id = msg.get("id")?.clone();

    match method {
        "initialize" => Some(jsonrpc_ok(&id, &initialize_result(&msg))),
        "tools/list" => {
            if hang_tools_list {
                None
            } else {
                Some(jsonrpc_ok(&id, &tools_list_result()))
            }
        }
        "resources/list" => {
            let result = json!({ "resources": [{ "uri": "memo://insights", "name": "insights" }] });
            Some(jsonrpc_ok(&id, &result))
        }
        "prompts/list" => {
            // No prompts capability; the client must treat this as empty.
            let error = json!({ "code": -32601, "message": "method not found" });
            Some(jsonrpc_err(&id, &error))
        }
        "tools/call" => match tools_call_result(&msg) {
            Ok(result) => Some(jsonrpc_ok(&id, &result)),
            Err(error) => Some(jsonrpc_err(&id, &error)),
        },
        _ => {
            let error = json!({ "code": -32601, "message": "method not found" });
            Some(jsonrpc_err(&id, &error))
        }
    }
}

fn initialize_result(msg: &serde_json::Value) -> serde_json::Value {
    let protocol_version = msg
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("2024-11-05")
        .to_string();

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {}, "resources": {} },
        "serverInfo": { "name": "gateway-stdio-test-server", "version": "0" }
    })
}

fn tools_list_result() -> serde_json::Value {
    json!({
        "tools": [
            {
                "name": "list_tables",
                "description": "List tables",
                "inputSchema": { "type": "object", "properties": {} }
            },
            {
                "name": "echo",
                "description": "Echo a message back",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "message": { "type": "string", "description": "Text to echo" }
                    },
                    "required": ["message"]
                }
            },
            {
                "name": "add",
                "description": "Add two integers",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "integer" },
                        "b": { "type": "integer", "default": 10 }
                    },
                    "required": ["a"]
                }
            }
        ]
    })
}

fn tools_call_result(
    msg: &serde_json::Value,
) -> Result<serde_json::Value, serde_json::Value> {
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));
    let name = params
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let text = match name {
        "list_tables" => "table1, table2".to_string(),
        "echo" => {
            let Some(message) = args.get("message").and_then(serde_json::Value::as_str) else {
                return Err(json!({ "code": -32602, "message": "missing message" }));
            };
            message.to_string()
        }
        "add" => {
            let a = args.get("a").and_then(serde_json::Value::as_i64).unwrap_or(0);
            let Some(b) = args.get("b").and_then(serde_json::Value::as_i64) else {
                return Err(json!({ "code": -32602, "message": "missing b" }));
            };
            (a + b).to_string()
        }
        _ => return Err(json!({ "code": -32601, "message": "unknown tool" })),
    };

    Ok(json!({
        "content": [{ "type": "text", "text": text }]
    }))
}

fn jsonrpc_ok(id: &serde_json::Value, result: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_err(id: &serde_json::Value, error: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn write_json_line(stdout: &mut dyn Write, v: &serde_json::Value) -> anyhow::Result<()> {
    writeln!(stdout, "{}", serde_json::to_string(v)?)?;
    stdout.flush()?;
    Ok(())
}
