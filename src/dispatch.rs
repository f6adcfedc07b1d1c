use serde_json::Value;

use crate::{
    compute_perf_diff, is_annotation_id, mint_correlation_id, retry_context_json,
    terminal_decision, url_path_key, validate_selector, CommandSnapshot, Daemon, QueryStatus,
    RetryState,
};

/// Extension-reported fields copied verbatim into completed results.
const PASS_THROUGH_FIELDS: &[&str] = &[
    "timing",
    "dom_changes",
    "dom_summary",
    "analysis",
    "content_script_status",
    "resolved_tab_id",
    "resolved_url",
    "target_context",
    "effective_tab_id",
    "effective_url",
    "effective_title",
    "final_url",
    "title",
];

const EVIDENCE_REQUIRED: &[&str] =
    &["command_result", "screenshot", "scoped_list_interactive_output"];

/// Sync unless the caller explicitly opted out.
pub(crate) fn wants_sync(args: &Value) -> bool {
    let truthy = |key: &str| args.get(key).and_then(|v| v.as_bool());
    if truthy("background") == Some(true) {
        return false;
    }
    if truthy("sync") == Some(false) {
        return false;
    }
    if truthy("wait") == Some(false) {
        return false;
    }
    true
}

pub(crate) fn command_prefix(action: &str) -> String {
    match action {
        "navigate" | "refresh" => format!("nav_{action}"),
        "annotate" => format!("ann_{action}"),
        _ => format!("dom_{action}"),
    }
}

pub(crate) fn error_payload(code: &str, message: &str, hint: &str) -> Value {
    serde_json::json!({
        "error": code,
        "message": message,
        "hint": hint,
    })
}

/// Dispatches a browser command through the registry and waits for its
/// result, with still-processing handoff when the wall is reached.
pub(crate) fn dispatch_command(daemon: &Daemon, action: &str, args: &Value) -> Value {
    if let Some(selector) = args.get("selector").and_then(|v| v.as_str()) {
        if let Err(code) = validate_selector(selector) {
            return error_payload(
                &code,
                "selector refused by the injection guard",
                "Use a plain CSS selector without markup or script URLs.",
            );
        }
    }

    let timings = &daemon.config.timings;
    if !daemon.registry.extension_connected(timings.liveness_window) {
        return error_payload(
            "no_data",
            "browser extension is not connected",
            "Open the extension on the target tab; it must be polling /sync before commands can run.",
        );
    }

    let correlation_id = mint_correlation_id(&command_prefix(action));
    let retry_state = daemon.retries.register(&correlation_id, action, args);

    // Navigations stash the current page's snapshot for the perf diff.
    if matches!(action, "navigate" | "refresh") {
        let target = args
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| daemon.registry.last_url());
        if let Some(url) = target {
            if let Some(snapshot) = daemon.buffers.latest_performance(&url_path_key(&url)) {
                daemon.registry.put_before_snapshot(&correlation_id, snapshot);
            }
        }
    }

    let mut params = args.clone();
    if let Value::Object(map) = &mut params {
        map.insert("action".to_string(), Value::String(action.to_string()));
        map.remove("correlation_id");
    }
    daemon.registry.create_pending(
        &correlation_id,
        "browser_action",
        params,
        timings.command_ttl,
    );
    daemon.lifecycle.event(
        "command_dispatched",
        serde_json::json!({ "correlation_id": correlation_id, "action": action }),
    );

    if !wants_sync(args) {
        return serde_json::json!({
            "status": "queued",
            "correlation_id": correlation_id,
            "queued": true,
            "final": false,
        });
    }

    let started = std::time::Instant::now();
    let mut attempts = 1u32;
    let mut snapshot = daemon.registry.wait_for(&correlation_id, timings.initial_wait);
    if let Some(snap) = &snapshot {
        if !snap.status.is_terminal() && daemon.registry.extension_connected(timings.liveness_window)
        {
            attempts = 2;
            snapshot = daemon.registry.wait_for(&correlation_id, timings.retry_wait);
        }
    }

    match snapshot {
        Some(snap) if snap.status.is_terminal() => {
            format_terminal(daemon, &snap, &retry_state)
        }
        Some(_) => {
            let elapsed_ms = started.elapsed().as_millis() as i64;
            let mut out = serde_json::json!({
                "status": "still_processing",
                "correlation_id": correlation_id,
                "queued": false,
                "final": false,
                "elapsed_ms": elapsed_ms,
                "queue_depth": daemon.registry.queue_depth(),
                "retry_context": {
                    "attempts": attempts,
                    "total_wait_ms": elapsed_ms,
                    "extension_connected": daemon
                        .registry
                        .extension_connected(timings.liveness_window),
                },
                "suggested_retry_ms": timings.suggested_retry_ms,
                "message": "Command is still processing. Poll observe(command_result, correlation_id) for the outcome.",
            });
            if let Some(position) = daemon.registry.queue_position(&correlation_id) {
                out["queue_position"] = serde_json::json!(position);
            }
            out
        }
        None => error_payload(
            "internal",
            "command vanished from the registry before completing",
            "Retry the command; report this if it recurs.",
        ),
    }
}

/// Reads a command result by correlation ID. Annotation commands block for
/// the extended window (a human is involved); everything else returns the
/// current snapshot immediately.
pub(crate) fn observe_command_result(daemon: &Daemon, correlation_id: &str) -> Value {
    let timings = &daemon.config.timings;
    let snapshot = if is_annotation_id(correlation_id) {
        daemon.registry.wait_for(correlation_id, timings.annotation_wait)
    } else {
        daemon.registry.snapshot(correlation_id)
    };
    let Some(snap) = snapshot else {
        let mut out = error_payload(
            "invalid_param",
            "unknown correlation ID",
            "The entry may have passed its retention window; re-dispatch the command.",
        );
        out["param"] = serde_json::json!("correlation_id");
        return out;
    };
    if !snap.status.is_terminal() {
        let mut out = serde_json::json!({
            "correlation_id": correlation_id,
            "status": "pending",
            "queued": false,
            "final": false,
            "elapsed_ms": snap.elapsed_ms(),
            "queue_depth": daemon.registry.queue_depth(),
        });
        if let Some(position) = daemon.registry.queue_position(correlation_id) {
            out["queue_position"] = serde_json::json!(position);
        }
        return out;
    }
    let retry_state = daemon
        .retries
        .get(correlation_id)
        .unwrap_or_else(|| fallback_retry_state(correlation_id));
    format_terminal(daemon, &snap, &retry_state)
}

fn fallback_retry_state(_correlation_id: &str) -> RetryState {
    RetryState {
        attempt: 1,
        max_attempts: crate::MAX_ATTEMPTS,
        strategy: "default".to_string(),
        fingerprint: String::new(),
        changed_strategy: false,
        parent_correlation_id: None,
        policy_violation: String::new(),
    }
}

/// Why a terminal result counts as failed, if it does. Complete payloads
/// can still fail via `success:false` or an embedded error message.
fn failure_reason(snap: &CommandSnapshot) -> Option<String> {
    match snap.status {
        QueryStatus::Complete => {
            let payload = snap.result.as_ref()?;
            let explicit_failure =
                payload.get("success").and_then(|v| v.as_bool()) == Some(false);
            let embedded = payload
                .get("error_code")
                .or_else(|| payload.get("error"))
                .or_else(|| payload.get("message"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty());
            if explicit_failure {
                Some(embedded.unwrap_or("command_failed").to_string())
            } else {
                embedded.map(|s| s.to_string())
            }
        }
        QueryStatus::Error => {
            let from_payload = snap
                .result
                .as_ref()
                .and_then(|p| p.get("error_code").or_else(|| p.get("error")))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty());
            Some(
                from_payload
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| {
                        if snap.error.is_empty() {
                            "command_failed".to_string()
                        } else {
                            snap.error.clone()
                        }
                    }),
            )
        }
        QueryStatus::Expired => Some("expired".to_string()),
        QueryStatus::Timeout => Some("ext_timeout".to_string()),
        QueryStatus::Pending => None,
    }
}

/// Formats a terminal command result: timing, field pass-through, perf
/// diff, and the retry contract's enrichment.
pub(crate) fn format_terminal(
    daemon: &Daemon,
    snap: &CommandSnapshot,
    retry_state: &RetryState,
) -> Value {
    let failure = failure_reason(snap);
    let failed = failure.is_some();
    let reason = failure.clone().unwrap_or_else(|| "success".to_string());
    let (terminal_stop, terminal_cause) = terminal_decision(retry_state, failed);

    let mut out = serde_json::json!({
        "correlation_id": snap.correlation_id,
        "status": snap.status.as_str(),
        "queued": false,
        "final": true,
        "created_at": snap.created_ms,
        "elapsed_ms": snap.elapsed_ms(),
    });

    match snap.status {
        QueryStatus::Complete => {
            if let Some(completed) = snap.completed_ms {
                out["completed_at"] = serde_json::json!(completed);
                out["timing_ms"] = serde_json::json!((completed - snap.created_ms).max(0));
            }
            if let Some(payload) = &snap.result {
                for field in PASS_THROUGH_FIELDS {
                    if let Some(value) = payload.get(*field) {
                        out[*field] = value.clone();
                    }
                }
                if let Some(final_url) = payload.get("final_url").and_then(|v| v.as_str()) {
                    daemon.registry.note_url(final_url);
                }
            }
            if let Some(code) = &failure {
                out["error"] = serde_json::json!(code);
                out["message"] = serde_json::json!(format!("command reported failure: {code}"));
            } else {
                attach_perf_diff(daemon, &snap.correlation_id, &mut out);
            }
        }
        QueryStatus::Error | QueryStatus::Expired | QueryStatus::Timeout => {
            out["error"] = serde_json::json!(reason);
            out["message"] = serde_json::json!(if snap.error.is_empty() {
                format!("command ended with status {}", snap.status.as_str())
            } else {
                snap.error.clone()
            });
            out["hint"] = serde_json::json!(match snap.status {
                QueryStatus::Expired | QueryStatus::Timeout =>
                    "The extension never replied. Check that the tab is open and the extension is polling /sync.",
                _ => "Inspect the page state with observe before retrying.",
            });
        }
        QueryStatus::Pending => {}
    }

    out["retry_context"] =
        retry_context_json(retry_state, &reason, terminal_stop, terminal_cause);

    if failed {
        if terminal_stop {
            out["terminal"] = serde_json::json!(true);
            out["retryable"] = serde_json::json!(false);
            out["retry"] = serde_json::json!(
                "Stop retrying this step and report the evidence bundle instead."
            );
            let mut evidence = serde_json::json!({
                "correlation_id": snap.correlation_id,
                "failure_reason": reason,
                "next_action": "Stop retries and report this bundle.",
                "required": EVIDENCE_REQUIRED,
                "retry_context": out["retry_context"].clone(),
            });
            if let Some(url) = daemon.registry.last_url() {
                evidence["url"] = serde_json::json!(url);
            }
            out["evidence_summary"] = evidence;
        } else {
            out["retryable"] = serde_json::json!(true);
            out["retry"] = serde_json::json!(
                "Retry once with a changed strategy (different selector, scope, or element handle), passing this correlation_id."
            );
        }
    }

    daemon.lifecycle.event(
        "command_completed",
        serde_json::json!({
            "correlation_id": snap.correlation_id,
            "kind": crate::correlation_prefix(&snap.correlation_id),
            "status": snap.status.as_str(),
            "reason": reason,
        }),
    );
    out
}

/// Attaches `perf_diff` when a before-snapshot was stashed and a strictly
/// newer same-path snapshot lands. The after snapshot can trail command
/// completion by a couple of seconds, hence the short poll.
fn attach_perf_diff(daemon: &Daemon, correlation_id: &str, out: &mut Value) {
    let Some(before) = daemon.registry.take_before_snapshot(correlation_id) else {
        return;
    };
    let key = url_path_key(&before.url);
    let timings = &daemon.config.timings;
    for poll in 0..=timings.perf_diff_polls {
        if let Some(after) = daemon.buffers.latest_performance(&key) {
            if after.ts > before.ts {
                out["perf_diff"] = compute_perf_diff(&before, &after);
                return;
            }
        }
        if poll < timings.perf_diff_polls {
            std::thread::sleep(timings.perf_diff_interval);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
