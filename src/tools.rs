use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::{
    clamp_limit, dispatch_command, error_payload, mode_hint, observe_command_result, url_path_key,
    validate_export_path, validate_noise_pattern, valid_modes, ActionFilter, AnalyzeArgs,
    ConfigureArgs, Daemon, GenerateArgs, InteractArgs, LogFilter, NetworkFilter, ObserveArgs,
    WsFilter,
};

/// Outcome of one tool call: a one-line human summary plus the structured
/// payload. Failures are payloads too, never transport errors.
pub(crate) struct ToolExecution {
    pub(crate) output: String,
    pub(crate) details: Value,
    pub(crate) is_error: bool,
}

impl ToolExecution {
    fn ok(output: impl Into<String>, details: Value) -> ToolExecution {
        ToolExecution { output: output.into(), details, is_error: false }
    }

    fn fail(code: &str, message: &str, hint: &str) -> ToolExecution {
        ToolExecution {
            output: format!("{code}: {message}"),
            details: error_payload(code, message, hint),
            is_error: true,
        }
    }

    fn fail_param(code: &str, message: &str, param: &str, hint: &str) -> ToolExecution {
        let mut exec = ToolExecution::fail(code, message, hint);
        exec.details["param"] = serde_json::json!(param);
        exec
    }
}

fn unknown_mode(tool: &str, got: &str) -> ToolExecution {
    ToolExecution::fail(
        "unknown_mode",
        &format!("'{got}' is not a {tool} mode"),
        &mode_hint(tool),
    )
}

/// A compiled log-noise suppression rule.
pub(crate) struct NoiseRule {
    pub(crate) pattern: String,
    pub(crate) regex: Regex,
}

pub(crate) fn is_noise(rules: &[NoiseRule], message: &str) -> bool {
    rules.iter().any(|rule| rule.regex.is_match(message))
}

pub(crate) fn execute_tool(
    daemon: &Daemon,
    name: &str,
    args: Value,
) -> Result<ToolExecution, String> {
    match name {
        "observe" => Ok(observe(daemon, args)),
        "analyze" => Ok(analyze(daemon, args)),
        "interact" => Ok(interact(daemon, args)),
        "configure" => Ok(configure(daemon, args)),
        "generate" => Ok(generate(daemon, args)),
        _ => Err(format!("unknown tool '{name}'")),
    }
}

// ── observe ─────────────────────────────────────────────────────────────

fn observe(daemon: &Daemon, args: Value) -> ToolExecution {
    if args.get("what").is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "observe requires 'what'",
            "what",
            &mode_hint("observe"),
        );
    }
    let parsed: ObserveArgs = match serde_json::from_value(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolExecution::fail_param(
                "invalid_param",
                &format!("bad observe arguments: {err}"),
                "what",
                &mode_hint("observe"),
            )
        }
    };

    match parsed.what.as_str() {
        "logs" => {
            let filter = LogFilter {
                level: parsed.level,
                contains: parsed.contains,
                since_ms: parsed.since_ms,
                limit: parsed.limit,
            };
            let rules = daemon.noise_rules.lock().unwrap();
            let logs: Vec<Value> = daemon
                .buffers
                .query_logs(&filter)
                .into_iter()
                .filter(|entry| !is_noise(&rules, &entry.message))
                .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
                .collect();
            ToolExecution::ok(
                format!("{} console log entries (newest first)", logs.len()),
                serde_json::json!({ "count": logs.len(), "logs": logs }),
            )
        }
        "network" => {
            let filter = NetworkFilter {
                url_contains: parsed.url_contains,
                method: None,
                status_min: None,
                limit: parsed.limit,
            };
            let bodies = daemon.buffers.query_network(&filter);
            ToolExecution::ok(
                format!("{} network bodies (newest first)", bodies.len()),
                serde_json::json!({ "count": bodies.len(), "requests": bodies }),
            )
        }
        "websocket" => {
            let filter = WsFilter {
                connection_id: parsed.connection_id,
                direction: parsed.direction,
                event: parsed.event,
                limit: parsed.limit,
            };
            let events = daemon.buffers.query_ws_events(&filter);
            ToolExecution::ok(
                format!("{} websocket events (newest first)", events.len()),
                serde_json::json!({ "count": events.len(), "events": events }),
            )
        }
        "websocket_status" => {
            let status = daemon.buffers.ws_status();
            let open = status["connections"].as_array().map(|a| a.len()).unwrap_or(0);
            ToolExecution::ok(format!("{open} active websocket connection(s)"), status)
        }
        "performance" => {
            if let Some(url) = &parsed.url {
                match daemon.buffers.latest_performance(&url_path_key(url)) {
                    Some(snapshot) => ToolExecution::ok(
                        format!("performance snapshot for {}", snapshot.url),
                        serde_json::to_value(snapshot).unwrap_or(Value::Null),
                    ),
                    None => ToolExecution::fail(
                        "no_data",
                        "no performance snapshot for that URL path",
                        "The extension posts snapshots on page load; navigate first.",
                    ),
                }
            } else {
                let snaps = daemon.buffers.performance_snapshots();
                ToolExecution::ok(
                    format!("{} performance snapshot(s)", snaps.len()),
                    serde_json::json!({ "count": snaps.len(), "snapshots": snaps }),
                )
            }
        }
        "actions" => {
            let filter = ActionFilter {
                action: parsed.action,
                url_contains: parsed.url_contains,
                limit: parsed.limit,
            };
            let actions = daemon.buffers.query_actions(&filter);
            ToolExecution::ok(
                format!("{} user actions (newest first)", actions.len()),
                serde_json::json!({ "count": actions.len(), "actions": actions }),
            )
        }
        "command_result" => {
            let Some(correlation_id) = parsed.correlation_id else {
                return ToolExecution::fail_param(
                    "missing_param",
                    "observe(command_result) requires 'correlation_id'",
                    "correlation_id",
                    "Pass the correlation_id returned by interact.",
                );
            };
            let details = observe_command_result(daemon, &correlation_id);
            let is_error = details.get("error").is_some();
            let status =
                details.get("status").and_then(|v| v.as_str()).unwrap_or("error").to_string();
            ToolExecution {
                output: format!("command {correlation_id}: {status}"),
                details,
                is_error,
            }
        }
        "pilot" => {
            let window = daemon.config.timings.liveness_window;
            let connected = daemon.registry.extension_connected(window);
            ToolExecution::ok(
                if connected { "extension connected" } else { "extension not connected" },
                serde_json::json!({
                    "enabled": connected,
                    "source": daemon.registry.pilot_source(window),
                    "extension_connected": connected,
                    "last_sync_age_ms": daemon.registry.last_sync_age_ms(),
                }),
            )
        }
        other => unknown_mode("observe", other),
    }
}

// ── analyze ─────────────────────────────────────────────────────────────

fn analyze(daemon: &Daemon, args: Value) -> ToolExecution {
    if args.get("what").is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "analyze requires 'what'",
            "what",
            &mode_hint("analyze"),
        );
    }
    let parsed: AnalyzeArgs = match serde_json::from_value(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolExecution::fail_param(
                "invalid_param",
                &format!("bad analyze arguments: {err}"),
                "what",
                &mode_hint("analyze"),
            )
        }
    };
    let top = clamp_limit(parsed.limit.or(Some(10)));

    match parsed.what.as_str() {
        "errors" => {
            let filter = LogFilter {
                level: Some("error".to_string()),
                limit: Some(crate::MAX_QUERY_LIMIT),
                ..Default::default()
            };
            let errors = daemon.buffers.query_logs(&filter);
            let mut grouped: HashMap<String, usize> = HashMap::new();
            for entry in &errors {
                *grouped.entry(entry.message.clone()).or_default() += 1;
            }
            let mut ranked: Vec<(String, usize)> = grouped.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(top);
            ToolExecution::ok(
                format!("{} error log entries, {} distinct messages", errors.len(), ranked.len()),
                serde_json::json!({
                    "total_errors": errors.len(),
                    "top": ranked
                        .into_iter()
                        .map(|(message, count)| serde_json::json!({ "message": message, "count": count }))
                        .collect::<Vec<_>>(),
                }),
            )
        }
        "network_failures" => {
            let filter = NetworkFilter {
                status_min: Some(400),
                limit: Some(crate::MAX_QUERY_LIMIT),
                ..Default::default()
            };
            let failures = daemon.buffers.query_network(&filter);
            let mut grouped: HashMap<(String, u16), usize> = HashMap::new();
            for body in &failures {
                *grouped.entry((body.url.clone(), body.status)).or_default() += 1;
            }
            let mut ranked: Vec<((String, u16), usize)> = grouped.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(top);
            ToolExecution::ok(
                format!("{} failing requests", failures.len()),
                serde_json::json!({
                    "total_failures": failures.len(),
                    "top": ranked
                        .into_iter()
                        .map(|((url, status), count)| {
                            serde_json::json!({ "url": url, "status": status, "count": count })
                        })
                        .collect::<Vec<_>>(),
                }),
            )
        }
        "performance" => {
            let target = parsed.url.or_else(|| daemon.registry.last_url());
            let Some(url) = target else {
                return ToolExecution::fail(
                    "no_data",
                    "no URL given and no tracked tab URL known",
                    "Pass url explicitly or navigate first.",
                );
            };
            let Some(snapshot) = daemon.buffers.latest_performance(&url_path_key(&url)) else {
                return ToolExecution::fail(
                    "no_data",
                    "no performance snapshot for that URL path",
                    "The extension posts snapshots on page load; navigate first.",
                );
            };
            let mut ratings = serde_json::Map::new();
            ratings.insert(
                "ttfb".to_string(),
                serde_json::json!(crate::rate_metric("ttfb", snapshot.timing.ttfb, snapshot.timing.ttfb)),
            );
            if let Some(fcp) = snapshot.timing.fcp {
                ratings.insert("fcp".to_string(), serde_json::json!(crate::rate_metric("fcp", fcp, fcp)));
            }
            if let Some(lcp) = snapshot.timing.lcp {
                ratings.insert("lcp".to_string(), serde_json::json!(crate::rate_metric("lcp", lcp, lcp)));
            }
            if let Some(cls) = snapshot.cls {
                ratings.insert("cls".to_string(), serde_json::json!(crate::rate_metric("cls", cls, cls)));
            }
            ToolExecution::ok(
                format!("performance analysis for {}", snapshot.url),
                serde_json::json!({ "snapshot": snapshot, "ratings": Value::Object(ratings) }),
            )
        }
        other => unknown_mode("analyze", other),
    }
}

// ── interact ────────────────────────────────────────────────────────────

fn interact(daemon: &Daemon, args: Value) -> ToolExecution {
    if args.get("action").is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "interact requires 'action'",
            "action",
            &mode_hint("interact"),
        );
    }
    let parsed: InteractArgs = match serde_json::from_value(args.clone()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolExecution::fail_param(
                "invalid_param",
                &format!("bad interact arguments: {err}"),
                "action",
                &mode_hint("interact"),
            )
        }
    };
    if !valid_modes("interact").contains(&parsed.action) {
        return unknown_mode("interact", &parsed.action);
    }
    if parsed.action == "navigate" && parsed.url.is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "navigate requires 'url'",
            "url",
            "Pass the absolute URL to load.",
        );
    }

    let details = dispatch_command(daemon, &parsed.action, &args);
    let is_error = details.get("error").is_some();
    let status = details.get("status").and_then(|v| v.as_str()).unwrap_or("error");
    let output = match status {
        "complete" => format!(
            "{} completed in {} ms",
            parsed.action,
            details.get("timing_ms").and_then(|v| v.as_i64()).unwrap_or(0)
        ),
        "queued" => format!("{} queued in the background", parsed.action),
        "still_processing" => format!(
            "{} still processing; poll observe(command_result)",
            parsed.action
        ),
        _ => format!(
            "{} ended with {}",
            parsed.action,
            details.get("error").and_then(|v| v.as_str()).unwrap_or(status)
        ),
    };
    ToolExecution { output, details, is_error }
}

// ── configure ───────────────────────────────────────────────────────────

fn configure(daemon: &Daemon, args: Value) -> ToolExecution {
    if args.get("action").is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "configure requires 'action'",
            "action",
            &mode_hint("configure"),
        );
    }
    let parsed: ConfigureArgs = match serde_json::from_value(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolExecution::fail_param(
                "invalid_param",
                &format!("bad configure arguments: {err}"),
                "action",
                &mode_hint("configure"),
            )
        }
    };

    match parsed.action.as_str() {
        "noise_rule" => match parsed.message_regex {
            Some(pattern) => {
                if let Err(reason) = validate_noise_pattern(&pattern) {
                    return ToolExecution::fail_param(
                        "invalid_param",
                        &reason,
                        "message_regex",
                        "Patterns are capped at 512 characters and must not nest quantifiers.",
                    );
                }
                let regex = match Regex::new(&pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        return ToolExecution::fail_param(
                            "invalid_param",
                            &format!("message_regex does not compile: {err}"),
                            "message_regex",
                            "Use RE2-style syntax without backreferences.",
                        )
                    }
                };
                let mut rules = daemon.noise_rules.lock().unwrap();
                rules.push(NoiseRule { pattern: pattern.clone(), regex });
                let patterns: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
                ToolExecution::ok(
                    format!("noise rule added ({} active)", patterns.len()),
                    serde_json::json!({ "added": pattern, "rules": patterns }),
                )
            }
            None => {
                let rules = daemon.noise_rules.lock().unwrap();
                let patterns: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
                ToolExecution::ok(
                    format!("{} noise rule(s) active", patterns.len()),
                    serde_json::json!({ "rules": patterns }),
                )
            }
        },
        "clear" => {
            let kinds = parsed.kinds.unwrap_or_else(|| {
                ["logs", "network", "websocket", "performance", "actions"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });
            let cleared = daemon.buffers.clear(&kinds);
            let total: usize = cleared.values().sum();
            ToolExecution::ok(
                format!("cleared {total} buffered item(s)"),
                serde_json::json!({ "cleared": cleared }),
            )
        }
        "limits" => {
            let limits = daemon.buffers.limits();
            let timings = &daemon.config.timings;
            ToolExecution::ok(
                "effective resource budgets",
                serde_json::json!({
                    "console_log_ring": limits.max_log_entries,
                    "log_ttl_secs": limits.log_ttl.as_secs(),
                    "network_budget_bytes": limits.network_budget_bytes,
                    "network_preview_cap": limits.network_preview_cap,
                    "websocket_ring": limits.ws_ring,
                    "websocket_active_cap": limits.ws_active_cap,
                    "websocket_closed_cap": limits.ws_closed_cap,
                    "action_ring": limits.max_actions,
                    "screenshot_table_cap": limits.screenshot_table_cap,
                    "retry_table_cap": timings.retry_table_cap,
                    "initial_wait_ms": timings.initial_wait.as_millis() as u64,
                    "retry_wait_ms": timings.retry_wait.as_millis() as u64,
                }),
            )
        }
        other => unknown_mode("configure", other),
    }
}

// ── generate ────────────────────────────────────────────────────────────

fn generate(daemon: &Daemon, args: Value) -> ToolExecution {
    if args.get("format").is_none() {
        return ToolExecution::fail_param(
            "missing_param",
            "generate requires 'format'",
            "format",
            &mode_hint("generate"),
        );
    }
    let parsed: GenerateArgs = match serde_json::from_value(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolExecution::fail_param(
                "invalid_param",
                &format!("bad generate arguments: {err}"),
                "format",
                &mode_hint("generate"),
            )
        }
    };

    match parsed.format.as_str() {
        "har" => {
            let export_root = daemon.config.state_dir.join("exports");
            let raw_path = parsed.path.unwrap_or_else(|| "session.har".to_string());
            let target = match validate_export_path(&raw_path, &export_root) {
                Ok(target) => target,
                Err(code) => {
                    return ToolExecution::fail(
                        &code,
                        "export path escapes the state directory",
                        "Pass a relative path; exports live under the state dir.",
                    )
                }
            };
            let bodies = daemon.buffers.query_network(&NetworkFilter {
                limit: Some(crate::MAX_QUERY_LIMIT),
                ..Default::default()
            });
            let har = build_har(&bodies);
            if let Some(parent) = target.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    return ToolExecution::fail(
                        "internal",
                        &format!("cannot create export directory: {err}"),
                        "Check state-dir permissions.",
                    );
                }
            }
            match std::fs::write(&target, serde_json::to_vec_pretty(&har).unwrap_or_default()) {
                Ok(()) => ToolExecution::ok(
                    format!("wrote {} entries to {}", bodies.len(), target.display()),
                    serde_json::json!({ "path": target.display().to_string(), "entries": bodies.len() }),
                ),
                Err(err) => ToolExecution::fail(
                    "internal",
                    &format!("export write failed: {err}"),
                    "Check state-dir permissions.",
                ),
            }
        }
        other => unknown_mode("generate", other),
    }
}

/// Minimal HAR 1.2 envelope over the buffered network bodies. Entries are
/// oldest first, the way HAR viewers expect.
fn build_har(bodies: &[crate::NetworkBody]) -> Value {
    let entries: Vec<Value> = bodies
        .iter()
        .rev()
        .map(|body| {
            serde_json::json!({
                "startedDateTime": body.ts,
                "time": 0,
                "request": { "method": body.method, "url": body.url, "headersSize": -1, "bodySize": -1 },
                "response": {
                    "status": body.status,
                    "statusText": "",
                    "headersSize": -1,
                    "bodySize": body.size,
                    "content": {
                        "size": body.size,
                        "mimeType": body.content_type,
                        "text": body.body_preview.clone().unwrap_or_default(),
                    },
                },
            })
        })
        .collect();
    serde_json::json!({
        "log": {
            "version": "1.2",
            "creator": { "name": "gasoline", "version": env!("CARGO_PKG_VERSION") },
            "entries": entries,
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────────
