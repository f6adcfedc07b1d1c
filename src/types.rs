use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parse_rfc3339_ms;

// ── Telemetry payloads ──────────────────────────────────────────────────

/// One browser console entry. Arbitrary extra fields from the extension are
/// preserved verbatim; only level/message/ts are required and validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LogEntry {
    pub(crate) level: String,
    pub(crate) message: String,
    pub(crate) ts: String,
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, Value>,
}

impl LogEntry {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !matches!(self.level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(format!("invalid level '{}'", self.level));
        }
        if self.message.is_empty() {
            return Err("empty message".to_string());
        }
        if parse_rfc3339_ms(&self.ts).is_none() {
            return Err(format!("invalid ts '{}'", self.ts));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NetworkBody {
    pub(crate) url: String,
    pub(crate) method: String,
    pub(crate) status: u16,
    #[serde(default)]
    pub(crate) content_type: String,
    #[serde(default)]
    pub(crate) size: u64,
    #[serde(default)]
    pub(crate) body_preview: Option<String>,
    pub(crate) ts: String,
}

impl NetworkBody {
    /// Byte cost charged against the network buffer budget.
    pub(crate) fn cost(&self) -> usize {
        self.body_preview.as_deref().map(str::len).unwrap_or(0) + self.url.len() + 64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WebSocketEvent {
    pub(crate) connection_id: String,
    pub(crate) event: String,
    #[serde(default)]
    pub(crate) direction: Option<String>,
    #[serde(default)]
    pub(crate) url: Option<String>,
    #[serde(default)]
    pub(crate) size: Option<u64>,
    #[serde(default)]
    pub(crate) data_preview: Option<String>,
    pub(crate) ts: String,
    #[serde(default)]
    pub(crate) close_code: Option<u16>,
    #[serde(default)]
    pub(crate) close_reason: Option<String>,
    #[serde(default)]
    pub(crate) sampled: Option<bool>,
}

impl WebSocketEvent {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.connection_id.is_empty() {
            return Err("empty connection_id".to_string());
        }
        if !matches!(self.event.as_str(), "open" | "message" | "close" | "error") {
            return Err(format!("invalid event '{}'", self.event));
        }
        if let Some(dir) = &self.direction {
            if !matches!(dir.as_str(), "incoming" | "outgoing") {
                return Err(format!("invalid direction '{dir}'"));
            }
        }
        if parse_rfc3339_ms(&self.ts).is_none() {
            return Err(format!("invalid ts '{}'", self.ts));
        }
        Ok(())
    }

    pub(crate) fn cost(&self) -> usize {
        self.data_preview.as_deref().map(str::len).unwrap_or(0) + self.connection_id.len() + 48
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct PerfTiming {
    #[serde(default)]
    pub(crate) ttfb: f64,
    #[serde(default)]
    pub(crate) dcl: f64,
    #[serde(default)]
    pub(crate) load: f64,
    #[serde(default)]
    pub(crate) fcp: Option<f64>,
    #[serde(default)]
    pub(crate) lcp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct PerfNetwork {
    #[serde(default)]
    pub(crate) transfer_size: u64,
    #[serde(default)]
    pub(crate) request_count: u64,
}

/// One performance snapshot per URL path; newest wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PerformanceSnapshot {
    pub(crate) url: String,
    pub(crate) ts: i64,
    pub(crate) timing: PerfTiming,
    #[serde(default)]
    pub(crate) cls: Option<f64>,
    #[serde(default)]
    pub(crate) network: PerfNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct SelectorFingerprint {
    #[serde(rename = "testId", default)]
    pub(crate) test_id: Option<String>,
    #[serde(default)]
    pub(crate) role: Option<String>,
    #[serde(rename = "ariaLabel", default)]
    pub(crate) aria_label: Option<String>,
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) css: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EnhancedAction {
    pub(crate) action: String,
    pub(crate) ts: i64,
    pub(crate) url: String,
    #[serde(rename = "toURL", default)]
    pub(crate) to_url: Option<String>,
    #[serde(default)]
    pub(crate) value: Option<String>,
    #[serde(default)]
    pub(crate) selected: Option<String>,
    #[serde(default)]
    pub(crate) selector: Option<SelectorFingerprint>,
}

impl EnhancedAction {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.action.is_empty() {
            return Err("empty action".to_string());
        }
        if self.ts <= 0 {
            return Err("missing ts".to_string());
        }
        Ok(())
    }
}

// ── Registry entries ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryStatus {
    Pending,
    Complete,
    Error,
    Expired,
    Timeout,
}

impl QueryStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Complete => "complete",
            QueryStatus::Error => "error",
            QueryStatus::Expired => "expired",
            QueryStatus::Timeout => "timeout",
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Pending)
    }
}

/// Point-in-time view of a registry entry, returned to waiters. Always a
/// deep copy; holders never alias registry-owned state.
#[derive(Debug, Clone)]
pub(crate) struct CommandSnapshot {
    pub(crate) correlation_id: String,
    pub(crate) query_type: String,
    pub(crate) status: QueryStatus,
    pub(crate) created_ms: i64,
    pub(crate) completed_ms: Option<i64>,
    pub(crate) result: Option<Value>,
    pub(crate) error: String,
}

impl CommandSnapshot {
    pub(crate) fn elapsed_ms(&self) -> i64 {
        match self.completed_ms {
            Some(done) => (done - self.created_ms).max(0),
            None => (crate::now_ms() - self.created_ms).max(0),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn log_entry(level: &str, message: &str, ts: &str) -> LogEntry {
        LogEntry {
            level: level.to_string(),
            message: message.to_string(),
            ts: ts.to_string(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_log_entry_validation() {
        assert!(log_entry("error", "boom", "2026-01-05T10:00:00Z").validate().is_ok());
        assert!(log_entry("fatal", "boom", "2026-01-05T10:00:00Z").validate().is_err());
        assert!(log_entry("info", "", "2026-01-05T10:00:00Z").validate().is_err());
        assert!(log_entry("info", "x", "yesterday").validate().is_err());
    }

    #[test]
    fn test_log_entry_preserves_extra_fields() {
        let raw = serde_json::json!({
            "level": "warn",
            "message": "deprecated API",
            "ts": "2026-01-05T10:00:00Z",
            "source": "app.js:12",
            "stack": ["a", "b"]
        });
        let entry: LogEntry = serde_json::from_value(raw).unwrap();
        assert!(entry.validate().is_ok());
        assert_eq!(entry.extra.get("source").unwrap(), "app.js:12");
        let back = serde_json::to_value(&entry).unwrap();
        assert_eq!(back.get("stack").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_ws_event_validation() {
        let event: WebSocketEvent = serde_json::from_value(serde_json::json!({
            "connection_id": "ws-1",
            "event": "message",
            "direction": "incoming",
            "size": 42,
            "ts": "2026-01-05T10:00:00Z"
        }))
        .unwrap();
        assert!(event.validate().is_ok());

        let bad: WebSocketEvent = serde_json::from_value(serde_json::json!({
            "connection_id": "ws-1",
            "event": "ping",
            "ts": "2026-01-05T10:00:00Z"
        }))
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_network_body_cost_includes_preview() {
        let body = NetworkBody {
            url: "https://example.com/api".to_string(),
            method: "GET".to_string(),
            status: 200,
            content_type: "application/json".to_string(),
            size: 1024,
            body_preview: Some("x".repeat(100)),
            ts: "2026-01-05T10:00:00Z".to_string(),
        };
        assert!(body.cost() > 100);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!QueryStatus::Pending.is_terminal());
        for s in [
            QueryStatus::Complete,
            QueryStatus::Error,
            QueryStatus::Expired,
            QueryStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_selector_fingerprint_wire_names() {
        let sel: SelectorFingerprint = serde_json::from_value(serde_json::json!({
            "testId": "submit",
            "ariaLabel": "Submit order",
            "css": "#submit"
        }))
        .unwrap();
        assert_eq!(sel.test_id.as_deref(), Some("submit"));
        assert_eq!(sel.aria_label.as_deref(), Some("Submit order"));
    }
}
