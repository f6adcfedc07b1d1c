use std::path::PathBuf;
use std::time::Duration;

use crate::{env_optional, env_u64, env_usize};

pub(crate) const DEFAULT_PORT: u16 = 7333;
pub(crate) const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Resource budgets for the telemetry buffers. Injected at construction so
/// tests can shrink them instead of patching globals.
#[derive(Debug, Clone)]
pub(crate) struct BufferLimits {
    pub(crate) max_log_entries: usize,
    pub(crate) log_ttl: Duration,
    pub(crate) network_budget_bytes: usize,
    pub(crate) network_preview_cap: usize,
    pub(crate) network_ttl: Duration,
    pub(crate) ws_ring: usize,
    pub(crate) ws_active_cap: usize,
    pub(crate) ws_closed_cap: usize,
    pub(crate) max_actions: usize,
    pub(crate) action_ttl: Duration,
    pub(crate) screenshot_table_cap: usize,
    pub(crate) screenshot_min_interval: Duration,
    pub(crate) screenshot_entry_ttl: Duration,
}

impl Default for BufferLimits {
    fn default() -> Self {
        BufferLimits {
            max_log_entries: 1_000,
            log_ttl: Duration::from_secs(30 * 60),
            network_budget_bytes: 5 * 1024 * 1024,
            network_preview_cap: 64 * 1024,
            network_ttl: Duration::from_secs(30 * 60),
            ws_ring: 500,
            ws_active_cap: 20,
            ws_closed_cap: 10,
            max_actions: 1_000,
            action_ttl: Duration::from_secs(30 * 60),
            screenshot_table_cap: 10_000,
            screenshot_min_interval: Duration::from_secs(1),
            screenshot_entry_ttl: Duration::from_secs(60),
        }
    }
}

/// Dispatch and registry timing contract. The defaults fit a 60 s host
/// tool-call ceiling: two wait stages inside one call with transport slack.
#[derive(Debug, Clone)]
pub(crate) struct DispatchTimings {
    pub(crate) initial_wait: Duration,
    pub(crate) retry_wait: Duration,
    pub(crate) annotation_wait: Duration,
    pub(crate) liveness_window: Duration,
    pub(crate) long_poll_max: Duration,
    pub(crate) command_ttl: Duration,
    pub(crate) retention: Duration,
    pub(crate) annotation_retention: Duration,
    pub(crate) reap_interval: Duration,
    pub(crate) suggested_retry_ms: u64,
    pub(crate) perf_diff_polls: u32,
    pub(crate) perf_diff_interval: Duration,
    pub(crate) retry_table_cap: usize,
}

impl Default for DispatchTimings {
    fn default() -> Self {
        DispatchTimings {
            initial_wait: Duration::from_secs(15),
            retry_wait: Duration::from_secs(5),
            annotation_wait: Duration::from_secs(55),
            liveness_window: Duration::from_secs(2),
            long_poll_max: Duration::from_secs(25),
            command_ttl: Duration::from_secs(60),
            retention: Duration::from_secs(60),
            annotation_retention: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(5),
            suggested_retry_ms: 2_000,
            perf_diff_polls: 5,
            perf_diff_interval: Duration::from_millis(500),
            retry_table_cap: 2_048,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DaemonConfig {
    pub(crate) port: u16,
    pub(crate) state_dir: PathBuf,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) api_key: Option<String>,
    pub(crate) limits: BufferLimits,
    pub(crate) timings: DispatchTimings,
    pub(crate) max_body_bytes: usize,
    /// WS ingest circuit breaker: open above this many events per second.
    pub(crate) ws_circuit_threshold: u32,
    pub(crate) ws_circuit_cooldown: Duration,
}

impl DaemonConfig {
    pub(crate) fn resolve(
        port: Option<u16>,
        state_dir: Option<PathBuf>,
        log_file: Option<PathBuf>,
        api_key: Option<String>,
        max_entries: Option<usize>,
    ) -> DaemonConfig {
        let mut limits = BufferLimits::default();
        if let Some(max) = max_entries {
            limits.max_log_entries = max.max(1);
            limits.max_actions = max.max(1);
        } else {
            limits.max_log_entries = env_usize("GASOLINE_MAX_ENTRIES", limits.max_log_entries);
        }
        let mut timings = DispatchTimings::default();
        timings.retry_table_cap = env_usize("GASOLINE_RETRY_TABLE_CAP", timings.retry_table_cap);

        DaemonConfig {
            port: port
                .or_else(|| env_optional("GASOLINE_PORT").and_then(|v| v.parse().ok()))
                .unwrap_or(DEFAULT_PORT),
            state_dir: state_dir.unwrap_or_else(state_dir_default),
            log_file,
            api_key: api_key.or_else(|| env_optional("GASOLINE_API_KEY")),
            limits,
            timings,
            max_body_bytes: env_u64("GASOLINE_MAX_BODY_BYTES", MAX_BODY_BYTES as u64) as usize,
            ws_circuit_threshold: env_u64("GASOLINE_WS_CIRCUIT_THRESHOLD", 200) as u32,
            ws_circuit_cooldown: Duration::from_secs(10),
        }
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Runtime state directory: `$GASOLINE_STATE_DIR`, else the OS
/// application-state dir, else a dot directory in `$HOME`.
pub(crate) fn state_dir_default() -> PathBuf {
    if let Some(dir) = env_optional("GASOLINE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(base) = dirs::data_local_dir() {
        return base.join("gasoline");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gasoline")
}

/// Pre-state-dir installs kept PID files and logs under `~/.gasoline`.
/// Read on startup; never written.
pub(crate) fn legacy_state_dir() -> Option<PathBuf> {
    let legacy = dirs::home_dir()?.join(".gasoline");
    legacy.is_dir().then_some(legacy)
}

// ── Tests ───────────────────────────────────────────────────────────────
