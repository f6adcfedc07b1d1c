use std::env;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use regex::Regex;

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    env_optional(name)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    env_optional(name)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match env_optional(name) {
        Some(value) => {
            let v = value.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "y" | "on")
        }
        None => default,
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

// ── Correlation IDs ─────────────────────────────────────────────────────
//
// Format is `prefix_nanos_rand`: a lowercase word prefix (underscores
// allowed), a nanosecond wall-clock timestamp, and a 63-bit random suffix.
// Unique within a process lifetime, safe to embed in URL paths.

fn correlation_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]+(?:_[a-z_]+)*_\d{16,19}_\d{1,19}$").unwrap())
}

pub(crate) fn mint_correlation_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let rand63 = rand::random::<u64>() >> 1;
    format!("{prefix}_{nanos}_{rand63}")
}

pub(crate) fn is_valid_correlation_id(id: &str) -> bool {
    correlation_id_pattern().is_match(id)
}

/// The word prefix of a correlation ID (everything before the two numeric
/// segments), or the whole string when it does not parse.
pub(crate) fn correlation_prefix(id: &str) -> &str {
    let mut end = id.len();
    for _ in 0..2 {
        match id[..end].rfind('_') {
            Some(pos) if pos + 1 < end && id[pos + 1..end].chars().all(|c| c.is_ascii_digit()) => {
                end = pos
            }
            _ => return id,
        }
    }
    &id[..end]
}

/// Annotation commands (`ann_*`) get extended blocking reads and a longer
/// retention window because a human is in the loop.
pub(crate) fn is_annotation_id(id: &str) -> bool {
    id.starts_with("ann_")
}

// ── Process control ─────────────────────────────────────────────────────

/// SIGTERM a process, give it two seconds, then SIGKILL if still alive.
#[cfg(unix)]
pub(crate) fn terminate_pid(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_secs(2));
    if unsafe { libc::kill(pid, 0) } == 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_pid(_pid: i32) {}

#[cfg(unix)]
pub(crate) fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: i32) -> bool {
    false
}

// ── Tests ───────────────────────────────────────────────────────────────
