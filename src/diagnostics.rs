use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::{lifecycle_log_path, pid_files, DaemonConfig};

// ── Redaction ───────────────────────────────────────────────────────────

const REDACTED: &str = "[REDACTED:bearer-token]";

fn bearer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+").unwrap())
}

fn key_header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)((?:x-gasoline-key|authorization|api[_-]?key)\s*[:=]\s*)\S+").unwrap()
    })
}

/// Strips bearer-like credentials out of a debug line. Applied at record
/// time so secrets never sit in the ring.
pub(crate) fn redact_secrets(line: &str) -> String {
    let pass1 = bearer_pattern().replace_all(line, format!("${{1}}{REDACTED}"));
    key_header_pattern().replace_all(&pass1, format!("${{1}}{REDACTED}")).into_owned()
}

// ── HTTP debug ring ─────────────────────────────────────────────────────

/// Bounded in-memory log of recent HTTP traffic, served by `/diagnostics`.
pub(crate) struct DebugRing {
    inner: Mutex<VecDeque<String>>,
    cap: usize,
}

impl DebugRing {
    pub(crate) fn new(cap: usize) -> DebugRing {
        DebugRing { inner: Mutex::new(VecDeque::new()), cap: cap.max(1) }
    }

    pub(crate) fn record(&self, line: &str) {
        let mut ring = self.inner.lock().unwrap();
        ring.push_back(format!("{} {}", crate::now_rfc3339(), redact_secrets(line)));
        while ring.len() > self.cap {
            ring.pop_front();
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }
}

// ── CLI health probes ───────────────────────────────────────────────────

fn probe_health(base_url: &str) -> Result<serde_json::Value, String> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(2))
        .timeout_read(Duration::from_secs(2))
        .build();
    match agent.get(&format!("{base_url}/health")).call() {
        Ok(resp) => resp.into_json().map_err(|e| format!("health parse: {e}")),
        Err(ureq::Error::Status(code, _)) => Err(format!("health returned {code}")),
        Err(err) => Err(format!("daemon unreachable: {err}")),
    }
}

/// `--check`: one-line liveness verdict, exit 1 when the daemon is down.
pub(crate) fn run_check(config: &DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    match probe_health(&config.base_url()) {
        Ok(health) => {
            let status = health.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
            let connected = health
                .pointer("/pilot/extension_connected")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            println!("status: {status}");
            println!("extension_connected: {connected}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// `--connect`: probe a running daemon as a named client and print its
/// health payload.
pub(crate) fn run_connect(
    config: &DaemonConfig,
    client_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(2))
        .timeout_read(Duration::from_secs(2))
        .build();
    let request = agent
        .get(&format!("{}/health", config.base_url()))
        .set(crate::CLIENT_HEADER, client_id.unwrap_or("cli"));
    match request.call() {
        Ok(resp) => {
            let health: serde_json::Value = resp.into_json()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Err(err) => Err(format!("daemon unreachable: {err}").into()),
    }
}

/// `--doctor`: liveness plus state-dir and lifecycle-log findings.
pub(crate) fn run_doctor(config: &DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("state_dir: {}", config.state_dir.display());
    let log_path = lifecycle_log_path(&config.state_dir, config.log_file.as_deref());
    println!(
        "lifecycle_log: {} ({})",
        log_path.display(),
        if log_path.exists() { "present" } else { "missing" }
    );
    for pid_file in pid_files(&config.state_dir) {
        let pid = crate::read_pid_file(&pid_file);
        let alive = pid.map(crate::pid_alive).unwrap_or(false);
        println!(
            "pid_file: {} pid={} alive={alive}",
            pid_file.display(),
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );
    }
    match probe_health(&config.base_url()) {
        Ok(health) => {
            println!("daemon: up");
            println!("uptime_ms: {}", health.get("uptime_ms").and_then(|v| v.as_i64()).unwrap_or(0));
            if let Some(pilot) = health.get("pilot") {
                println!(
                    "pilot: source={} connected={}",
                    pilot.get("source").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    pilot.get("extension_connected").and_then(|v| v.as_bool()).unwrap_or(false)
                );
            }
            if let Some(warnings) = health.get("warnings").and_then(|v| v.as_array()) {
                if warnings.is_empty() {
                    println!("warnings: none");
                } else {
                    println!("warnings:");
                    for warning in warnings {
                        println!("- {}", warning.as_str().unwrap_or("?"));
                    }
                }
            }
            Ok(())
        }
        Err(err) => {
            println!("daemon: down ({err})");
            Ok(())
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_tokens_redacted() {
        let line = "POST /mcp Authorization: Bearer sk-abc123.def-456";
        let redacted = redact_secrets(line);
        assert!(!redacted.contains("sk-abc123"), "{redacted}");
        assert!(redacted.contains("[REDACTED:bearer-token]"));
    }

    #[test]
    fn test_gasoline_key_header_redacted() {
        let line = "POST /mcp X-Gasoline-Key: super-secret-value status=200";
        let redacted = redact_secrets(line);
        assert!(!redacted.contains("super-secret-value"));
        assert!(redacted.contains("[REDACTED:bearer-token]"));
        assert!(redacted.contains("status=200"));
    }

    #[test]
    fn test_plain_lines_untouched() {
        let line = "GET /health status=200 in 2ms";
        assert!(redact_secrets(line).contains("GET /health status=200 in 2ms"));
    }

    #[test]
    fn test_ring_bounded_and_ordered() {
        let ring = DebugRing::new(3);
        for i in 0..5 {
            ring.record(&format!("GET /health {i}"));
        }
        let lines = ring.snapshot();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("GET /health 2"));
        assert!(lines[2].contains("GET /health 4"));
    }

    #[test]
    fn test_ring_records_redacted() {
        let ring = DebugRing::new(8);
        ring.record("POST /logs Authorization: Bearer topsecret");
        let lines = ring.snapshot();
        assert!(!lines[0].contains("topsecret"));
    }
}
