use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

pub(crate) const MAX_ATTEMPTS: u32 = 2;

/// Selector-affecting parameter subset, in the order checked for the
/// strategy tag. Fingerprints hash exactly these.
const FINGERPRINT_FIELDS: &[&str] = &[
    "action",
    "selector",
    "scope_selector",
    "scope_rect",
    "annotation_rect",
    "element_id",
    "index",
    "frame",
    "world",
    "text",
    "value",
    "wait_for",
];

#[derive(Debug, Clone)]
pub(crate) struct RetryState {
    pub(crate) attempt: u32,
    pub(crate) max_attempts: u32,
    pub(crate) strategy: String,
    pub(crate) fingerprint: String,
    pub(crate) changed_strategy: bool,
    pub(crate) parent_correlation_id: Option<String>,
    pub(crate) policy_violation: String,
}

/// First-match targeting strategy classification.
pub(crate) fn strategy_tag(params: &Value) -> &'static str {
    let has = |key: &str| params.get(key).map(|v| !v.is_null()).unwrap_or(false);
    if has("element_id") {
        "element_handle"
    } else if has("scope_selector") || has("scope_rect") || has("annotation_rect") {
        "scoped_selector"
    } else if has("frame") {
        "frame_targeted"
    } else if has("selector") {
        "selector"
    } else if has("index") {
        "indexed"
    } else if has("world") {
        "world_switch"
    } else {
        "default"
    }
}

/// Stable serialization of the selector-affecting params, hashed. Equal
/// fingerprints mean "same strategy" across attempts.
pub(crate) fn strategy_fingerprint(action: &str, params: &Value) -> String {
    let mut canonical = serde_json::Map::new();
    canonical.insert("action".to_string(), Value::String(action.to_string()));
    for field in FINGERPRINT_FIELDS {
        if *field == "action" {
            continue;
        }
        if let Some(value) = params.get(*field) {
            if !value.is_null() {
                canonical.insert((*field).to_string(), value.clone());
            }
        }
    }
    let serialized = serde_json::to_string(&Value::Object(canonical)).unwrap_or_default();
    blake3::hash(serialized.as_bytes()).to_hex().to_string()
}

/// Per-correlation retry bookkeeping, bounded by evicting the oldest entry
/// once the cap is exceeded.
pub(crate) struct RetryTable {
    inner: Mutex<RetryTableInner>,
    cap: usize,
}

struct RetryTableInner {
    states: HashMap<String, RetryState>,
    order: VecDeque<String>,
}

impl RetryTable {
    pub(crate) fn new(cap: usize) -> RetryTable {
        RetryTable {
            inner: Mutex::new(RetryTableInner { states: HashMap::new(), order: VecDeque::new() }),
            cap: cap.max(1),
        }
    }

    /// Records the retry state for a fresh dispatch. `params` may carry
    /// `correlation_id` naming the parent attempt.
    pub(crate) fn register(&self, id: &str, action: &str, params: &Value) -> RetryState {
        let fingerprint = strategy_fingerprint(action, params);
        let strategy = strategy_tag(params).to_string();
        let parent_id = params
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let mut inner = self.inner.lock().unwrap();
        let state = match &parent_id {
            None => RetryState {
                attempt: 1,
                max_attempts: MAX_ATTEMPTS,
                strategy,
                fingerprint,
                changed_strategy: false,
                parent_correlation_id: None,
                policy_violation: String::new(),
            },
            Some(parent) => match inner.states.get(parent) {
                Some(prior) => {
                    let raw_attempt = prior.attempt + 1;
                    let attempt = raw_attempt.min(MAX_ATTEMPTS);
                    let changed_strategy = fingerprint != prior.fingerprint;
                    let policy_violation = if raw_attempt > MAX_ATTEMPTS {
                        "attempt_limit_exceeded"
                    } else if !changed_strategy {
                        "strategy_unchanged"
                    } else {
                        ""
                    };
                    RetryState {
                        attempt,
                        max_attempts: MAX_ATTEMPTS,
                        strategy,
                        fingerprint,
                        changed_strategy,
                        parent_correlation_id: Some(parent.clone()),
                        policy_violation: policy_violation.to_string(),
                    }
                }
                // Parent evicted: the safe reading is "this is a retry".
                None => RetryState {
                    attempt: MAX_ATTEMPTS,
                    max_attempts: MAX_ATTEMPTS,
                    strategy,
                    fingerprint,
                    changed_strategy: false,
                    parent_correlation_id: Some(parent.clone()),
                    policy_violation: "parent_context_missing".to_string(),
                },
            },
        };

        inner.states.insert(id.to_string(), state.clone());
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.states.remove(&evicted);
            }
        }
        state
    }

    pub(crate) fn get(&self, id: &str) -> Option<RetryState> {
        self.inner.lock().unwrap().states.get(id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().states.len()
    }
}

/// Terminal decision for a failed attempt. The unchanged-strategy check
/// runs first so an identical second attempt reports the strategy cause.
pub(crate) fn terminal_decision(state: &RetryState, failed: bool) -> (bool, Option<&'static str>) {
    if !failed {
        return (false, None);
    }
    if state.attempt > 1 && !state.changed_strategy {
        return (true, Some("strategy_not_changed"));
    }
    if state.attempt >= state.max_attempts {
        return (true, Some("max_attempts_reached"));
    }
    (false, None)
}

/// The `retry_context` bundle attached to every terminal command response.
pub(crate) fn retry_context_json(
    state: &RetryState,
    reason: &str,
    terminal_stop: bool,
    terminal_cause: Option<&str>,
) -> Value {
    let mut out = serde_json::json!({
        "attempt": state.attempt,
        "max_attempts": state.max_attempts,
        "strategy": state.strategy,
        "changed_strategy": state.changed_strategy,
        "reason": reason,
        "terminal_stop": terminal_stop,
    });
    if let Some(parent) = &state.parent_correlation_id {
        out["parent_correlation_id"] = serde_json::json!(parent);
    }
    if !state.policy_violation.is_empty() {
        out["policy_violation"] = serde_json::json!(state.policy_violation);
    }
    if let Some(cause) = terminal_cause {
        out["terminal_cause"] = serde_json::json!(cause);
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tag_priority() {
        let tag = |params: Value| strategy_tag(&params);
        assert_eq!(tag(serde_json::json!({ "element_id": "e1", "selector": "#x" })), "element_handle");
        assert_eq!(tag(serde_json::json!({ "scope_selector": ".list", "selector": "#x" })), "scoped_selector");
        assert_eq!(tag(serde_json::json!({ "annotation_rect": { "x": 0 } })), "scoped_selector");
        assert_eq!(tag(serde_json::json!({ "frame": "checkout", "selector": "#x" })), "frame_targeted");
        assert_eq!(tag(serde_json::json!({ "selector": "#x" })), "selector");
        assert_eq!(tag(serde_json::json!({ "index": 3 })), "indexed");
        assert_eq!(tag(serde_json::json!({ "world": "isolated" })), "world_switch");
        assert_eq!(tag(serde_json::json!({})), "default");
    }

    #[test]
    fn test_fingerprint_stable_under_key_order() {
        let a = strategy_fingerprint(
            "click",
            &serde_json::json!({ "selector": "#x", "frame": "main", "timeout_ms": 100 }),
        );
        let b = strategy_fingerprint(
            "click",
            &serde_json::json!({ "frame": "main", "selector": "#x", "background": true }),
        );
        assert_eq!(a, b, "non-fingerprint fields must not matter");
        let c = strategy_fingerprint("click", &serde_json::json!({ "selector": "#y" }));
        assert_ne!(a, c);
    }

    #[test]
    fn test_fresh_dispatch_is_attempt_one() {
        let table = RetryTable::new(16);
        let state = table.register(
            "dom_click_1234567890123456_1",
            "click",
            &serde_json::json!({ "selector": "#btn" }),
        );
        assert_eq!(state.attempt, 1);
        assert_eq!(state.max_attempts, 2);
        assert_eq!(state.strategy, "selector");
        assert!(state.policy_violation.is_empty());
        assert!(!state.changed_strategy);
    }

    #[test]
    fn test_retry_with_same_fingerprint_flags_violation() {
        let table = RetryTable::new(16);
        table.register(
            "dom_click_1234567890123456_1",
            "click",
            &serde_json::json!({ "selector": "#x" }),
        );
        let retry = table.register(
            "dom_click_1234567890123456_2",
            "click",
            &serde_json::json!({ "selector": "#x", "correlation_id": "dom_click_1234567890123456_1" }),
        );
        assert_eq!(retry.attempt, 2);
        assert!(!retry.changed_strategy);
        assert_eq!(retry.policy_violation, "strategy_unchanged");
        let (terminal, cause) = terminal_decision(&retry, true);
        assert!(terminal);
        assert_eq!(cause, Some("strategy_not_changed"));
    }

    #[test]
    fn test_retry_with_changed_strategy() {
        let table = RetryTable::new(16);
        table.register(
            "dom_click_1234567890123456_1",
            "click",
            &serde_json::json!({ "selector": "#x" }),
        );
        let retry = table.register(
            "dom_click_1234567890123456_2",
            "click",
            &serde_json::json!({ "element_id": "e77", "correlation_id": "dom_click_1234567890123456_1" }),
        );
        assert_eq!(retry.attempt, 2);
        assert!(retry.changed_strategy);
        assert_eq!(retry.strategy, "element_handle");
        assert!(retry.policy_violation.is_empty());
        let (terminal, cause) = terminal_decision(&retry, true);
        assert!(terminal);
        assert_eq!(cause, Some("max_attempts_reached"));
    }

    #[test]
    fn test_attempt_capped_with_violation() {
        let table = RetryTable::new(16);
        table.register("dom_click_1234567890123456_1", "click", &serde_json::json!({ "selector": "#x" }));
        table.register(
            "dom_click_1234567890123456_2",
            "click",
            &serde_json::json!({ "selector": "#y", "correlation_id": "dom_click_1234567890123456_1" }),
        );
        let third = table.register(
            "dom_click_1234567890123456_3",
            "click",
            &serde_json::json!({ "selector": "#z", "correlation_id": "dom_click_1234567890123456_2" }),
        );
        assert_eq!(third.attempt, 2, "attempt caps at max_attempts");
        assert_eq!(third.policy_violation, "attempt_limit_exceeded");
    }

    #[test]
    fn test_missing_parent_context() {
        let table = RetryTable::new(16);
        let state = table.register(
            "dom_click_1234567890123456_9",
            "click",
            &serde_json::json!({ "selector": "#x", "correlation_id": "dom_click_1234567890123456_0" }),
        );
        assert_eq!(state.attempt, 2);
        assert_eq!(state.policy_violation, "parent_context_missing");
    }

    #[test]
    fn test_success_is_never_terminal() {
        let table = RetryTable::new(16);
        let state = table.register(
            "dom_click_1234567890123456_1",
            "click",
            &serde_json::json!({ "selector": "#x" }),
        );
        let (terminal, cause) = terminal_decision(&state, false);
        assert!(!terminal);
        assert!(cause.is_none());
    }

    #[test]
    fn test_first_failure_is_retryable() {
        let table = RetryTable::new(16);
        let state = table.register(
            "dom_click_1234567890123456_1",
            "click",
            &serde_json::json!({ "selector": "#x" }),
        );
        let (terminal, _) = terminal_decision(&state, true);
        assert!(!terminal);
    }

    #[test]
    fn test_table_evicts_oldest_beyond_cap() {
        let table = RetryTable::new(3);
        for i in 0..5 {
            table.register(
                &format!("dom_click_123456789012345{i}_1"),
                "click",
                &serde_json::json!({ "selector": "#x" }),
            );
        }
        assert_eq!(table.len(), 3);
        assert!(table.get("dom_click_1234567890123450_1").is_none());
        assert!(table.get("dom_click_1234567890123454_1").is_some());
    }

    #[test]
    fn test_retry_context_shape() {
        let state = RetryState {
            attempt: 2,
            max_attempts: 2,
            strategy: "selector".to_string(),
            fingerprint: "abc".to_string(),
            changed_strategy: false,
            parent_correlation_id: Some("dom_click_1234567890123456_1".to_string()),
            policy_violation: "strategy_unchanged".to_string(),
        };
        let ctx = retry_context_json(&state, "element_not_found", true, Some("strategy_not_changed"));
        assert_eq!(ctx["attempt"], 2);
        assert_eq!(ctx["terminal_stop"], true);
        assert_eq!(ctx["terminal_cause"], "strategy_not_changed");
        assert_eq!(ctx["policy_violation"], "strategy_unchanged");
        assert_eq!(ctx["parent_correlation_id"], "dom_click_1234567890123456_1");
    }
}
