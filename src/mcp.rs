use std::io::{self, BufRead, Write};

use serde_json::Value;

use crate::{execute_tool, tool_definitions_json, Daemon};

pub(crate) const PARSE_ERROR: i64 = -32700;
pub(crate) const INVALID_REQUEST: i64 = -32600;
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;
pub(crate) const INVALID_PARAMS: i64 = -32602;
pub(crate) const INTERNAL_ERROR: i64 = -32603;

pub(crate) fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Parses one newline-delimited JSON-RPC frame. A syntactically broken
/// frame yields the ready-to-send parse error envelope.
pub(crate) fn parse_rpc_frame(line: &str) -> Result<Value, Value> {
    serde_json::from_str(line.trim())
        .map_err(|err| rpc_error(Value::Null, PARSE_ERROR, &format!("parse error: {err}")))
}

/// Reads one frame from a line-delimited stream. `None` on EOF; blank
/// lines are skipped.
pub(crate) fn read_rpc_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
}

/// Writes exactly one newline-terminated frame and flushes.
pub(crate) fn write_rpc_frame<W: Write>(writer: &mut W, frame: &Value) -> io::Result<()> {
    let body = serde_json::to_string(frame)?;
    writer.write_all(body.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Handles one JSON-RPC request against the daemon. Returns `None` for
/// notifications (nothing goes on the wire).
pub(crate) fn handle_rpc(daemon: &Daemon, msg: &Value) -> Option<Value> {
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let has_id = !id.is_null();
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

    if msg.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") || method.is_empty() {
        return has_id.then(|| rpc_error(id, INVALID_REQUEST, "invalid request"));
    }
    let params = msg.get("params").cloned().unwrap_or_else(|| serde_json::json!({}));

    match method {
        "initialize" => {
            let protocol = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("2024-11-05");
            Some(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": protocol,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": {
                        "name": "gasoline",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                },
            }))
        }
        "notifications/initialized" => None,
        "ping" => Some(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })),
        "tools/list" => Some(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "tools": tool_definitions_json() },
        })),
        "tools/call" => {
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let arguments =
                params.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));
            match execute_tool(daemon, name, arguments) {
                Ok(exec) => {
                    let text = format!(
                        "{}\n{}",
                        exec.output,
                        serde_json::to_string_pretty(&exec.details).unwrap_or_default()
                    );
                    Some(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [ { "type": "text", "text": text } ],
                            "isError": exec.is_error,
                        },
                    }))
                }
                Err(err) => Some(rpc_error(id, INVALID_PARAMS, &err)),
            }
        }
        "shutdown" => Some(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null })),
        _ => has_id.then(|| rpc_error(id, METHOD_NOT_FOUND, "method not found")),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
