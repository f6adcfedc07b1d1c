use serde_json::Value;

/// MCP tool catalog. The first property of each schema is the mode
/// discriminator (`what` / `action` / `format`); handler tables match it
/// exhaustively and unknown values answer with a hint built from here.
pub(crate) fn tool_definitions_json() -> Vec<Value> {
    vec![
        serde_json::json!({
            "name": "observe",
            "description": "Read buffered browser telemetry or a command result.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "what": {
                        "type": "string",
                        "enum": ["logs", "network", "websocket", "websocket_status",
                                 "performance", "actions", "command_result", "pilot"]
                    },
                    "correlation_id": { "type": "string" },
                    "level": { "type": "string" },
                    "contains": { "type": "string" },
                    "url_contains": { "type": "string" },
                    "connection_id": { "type": "string" },
                    "direction": { "type": "string" },
                    "event": { "type": "string" },
                    "action": { "type": "string" },
                    "url": { "type": "string" },
                    "since_ms": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "required": ["what"]
            }
        }),
        serde_json::json!({
            "name": "analyze",
            "description": "Summarize buffered telemetry (errors, failing requests, page performance).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "what": {
                        "type": "string",
                        "enum": ["errors", "network_failures", "performance"]
                    },
                    "url": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["what"]
            }
        }),
        serde_json::json!({
            "name": "interact",
            "description": "Dispatch a DOM or navigation command to the browser extension and wait for the result.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["click", "input", "select", "navigate", "refresh",
                                 "scroll", "hover", "wait", "annotate"]
                    },
                    "selector": { "type": "string" },
                    "text": { "type": "string" },
                    "value": { "type": "string" },
                    "url": { "type": "string" },
                    "element_id": { "type": "string" },
                    "index": { "type": "integer" },
                    "frame": { "type": "string" },
                    "world": { "type": "string" },
                    "scope_selector": { "type": "string" },
                    "scope_rect": { "type": "object" },
                    "annotation_rect": { "type": "object" },
                    "wait_for": { "type": "string" },
                    "correlation_id": { "type": "string" },
                    "background": { "type": "boolean" },
                    "sync": { "type": "boolean" },
                    "wait": { "type": "boolean" },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["action"]
            }
        }),
        serde_json::json!({
            "name": "configure",
            "description": "Adjust runtime behavior: noise rules, buffer clears, effective limits.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["noise_rule", "clear", "limits"]
                    },
                    "message_regex": { "type": "string" },
                    "kinds": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["action"]
            }
        }),
        serde_json::json!({
            "name": "generate",
            "description": "Export buffered telemetry as a file under the state directory.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["har"] },
                    "path": { "type": "string" }
                },
                "required": ["format"]
            }
        }),
    ]
}

/// The discriminator property name for a tool.
pub(crate) fn mode_key(tool: &str) -> &'static str {
    match tool {
        "observe" | "analyze" => "what",
        "generate" => "format",
        _ => "action",
    }
}

/// Enum values of a tool's discriminator, read back out of the schema so
/// hints can never drift from the published catalog.
pub(crate) fn valid_modes(tool: &str) -> Vec<String> {
    let key = mode_key(tool);
    tool_definitions_json()
        .iter()
        .find(|def| def["name"] == tool)
        .and_then(|def| def["inputSchema"]["properties"][key]["enum"].as_array().cloned())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn mode_hint(tool: &str) -> String {
    format!("Valid params: {} ∈ {}", mode_key(tool), valid_modes(tool).join("|"))
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_and_required() {
        let defs = tool_definitions_json();
        let names: Vec<&str> = defs.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["observe", "analyze", "interact", "configure", "generate"]);
        for def in &defs {
            let required = def["inputSchema"]["required"].as_array().unwrap();
            assert_eq!(required.len(), 1);
            assert_eq!(required[0], mode_key(def["name"].as_str().unwrap()));
        }
    }

    #[test]
    fn test_valid_modes_from_schema() {
        let modes = valid_modes("observe");
        assert!(modes.contains(&"logs".to_string()));
        assert!(modes.contains(&"command_result".to_string()));
        assert!(valid_modes("generate").contains(&"har".to_string()));
        assert!(valid_modes("nonexistent").is_empty());
    }

    #[test]
    fn test_mode_hint_mentions_values() {
        let hint = mode_hint("interact");
        assert!(hint.starts_with("Valid params: action ∈ "));
        assert!(hint.contains("click"));
        assert!(hint.contains("refresh"));
    }
}
