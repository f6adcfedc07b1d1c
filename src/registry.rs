use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::{is_annotation_id, now_ms, CommandSnapshot, PerformanceSnapshot, QueryStatus};

struct Entry {
    query_type: String,
    params: Value,
    created: Instant,
    created_ms: i64,
    ttl: Duration,
    status: QueryStatus,
    delivered: bool,
    result: Option<Value>,
    error: String,
    completed_ms: Option<i64>,
    terminal_at: Option<Instant>,
}

impl Entry {
    fn snapshot(&self, id: &str) -> CommandSnapshot {
        CommandSnapshot {
            correlation_id: id.to_string(),
            query_type: self.query_type.clone(),
            status: self.status,
            created_ms: self.created_ms,
            completed_ms: self.completed_ms,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    fn finish(&mut self, status: QueryStatus, result: Option<Value>, error: String) {
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_ms = Some(now_ms());
        self.terminal_at = Some(Instant::now());
    }
}

struct RegistryInner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
    before_snapshots: HashMap<String, PerformanceSnapshot>,
    last_sync: Option<Instant>,
    /// Long-polls currently parked in `drain_for`. A parked extension is a
    /// connected extension even when `last_sync` has aged past the window.
    active_polls: u32,
    last_session: Option<String>,
    last_tab: Option<i64>,
    last_url: Option<String>,
}

/// Correlates async extension responses to blocked tool calls (C2).
///
/// One mutex owns the whole map; a single condvar broadcasts every state
/// change and waiters re-check their entry. Registration and transition
/// happen under the same lock, so missed signals are impossible.
pub(crate) struct CommandRegistry {
    inner: Mutex<RegistryInner>,
    cond: Condvar,
    retention: Duration,
    annotation_retention: Duration,
}

impl CommandRegistry {
    pub(crate) fn new(retention: Duration, annotation_retention: Duration) -> CommandRegistry {
        CommandRegistry {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                before_snapshots: HashMap::new(),
                last_sync: None,
                active_polls: 0,
                last_session: None,
                last_tab: None,
                last_url: None,
            }),
            cond: Condvar::new(),
            retention,
            annotation_retention,
        }
    }

    /// Inserts a fresh pending entry. The extension's next `/sync` drain
    /// picks it up; the dispatcher blocks on `wait_for`.
    pub(crate) fn create_pending(&self, id: &str, query_type: &str, params: Value, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            id.to_string(),
            Entry {
                query_type: query_type.to_string(),
                params,
                created: Instant::now(),
                created_ms: now_ms(),
                ttl,
                status: QueryStatus::Pending,
                delivered: false,
                result: None,
                error: String::new(),
                completed_ms: None,
                terminal_at: None,
            },
        );
        inner.order.push_back(id.to_string());
        self.cond.notify_all();
    }

    /// The `/sync` long-poll: parks until at least one undelivered pending
    /// command exists or `max_wait` elapses, then returns the batch marked
    /// as delivered (entries stay pending until a result arrives).
    pub(crate) fn drain_for(
        &self,
        session_id: &str,
        tab_id: Option<i64>,
        max_wait: Duration,
    ) -> Vec<Value> {
        let deadline = Instant::now() + max_wait;
        let mut inner = self.inner.lock().unwrap();
        inner.last_sync = Some(Instant::now());
        inner.last_session = Some(session_id.to_string());
        inner.last_tab = tab_id;
        inner.active_polls += 1;
        loop {
            let batch: Vec<Value> = {
                let order: Vec<String> = inner.order.iter().cloned().collect();
                order
                    .iter()
                    .filter_map(|id| {
                        let entry = inner.entries.get_mut(id)?;
                        if entry.status == QueryStatus::Pending && !entry.delivered {
                            entry.delivered = true;
                            Some(serde_json::json!({
                                "correlation_id": id,
                                "type": entry.query_type,
                                "params": entry.params,
                            }))
                        } else {
                            None
                        }
                    })
                    .collect()
            };
            if !batch.is_empty() {
                // Leaving with work in hand still counts as a poll.
                inner.last_sync = Some(Instant::now());
                inner.active_polls = inner.active_polls.saturating_sub(1);
                return batch;
            }
            let now = Instant::now();
            if now >= deadline {
                inner.last_sync = Some(Instant::now());
                inner.active_polls = inner.active_polls.saturating_sub(1);
                return Vec::new();
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Transitions pending → complete (or error when `error` is non-empty)
    /// and wakes every waiter. First caller wins; later calls are no-ops.
    pub(crate) fn set_result(&self, id: &str, result: Option<Value>, error: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        if entry.status != QueryStatus::Pending {
            return false;
        }
        let status = if error.is_empty() { QueryStatus::Complete } else { QueryStatus::Error };
        entry.finish(status, result, error.to_string());
        self.cond.notify_all();
        true
    }

    /// Blocks until the entry leaves pending, its own TTL lapses (marking
    /// it timed out), or the caller's deadline passes. Never leaves orphan
    /// state: a deadline return hands back the current pending snapshot.
    pub(crate) fn wait_for(&self, id: &str, timeout: Duration) -> Option<CommandSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            {
                let entry = inner.entries.get(id)?;
                if entry.status.is_terminal() {
                    return Some(entry.snapshot(id));
                }
                if entry.created.elapsed() > entry.ttl {
                    let entry = inner.entries.get_mut(id)?;
                    entry.finish(
                        QueryStatus::Timeout,
                        None,
                        "command timed out before the extension responded".to_string(),
                    );
                    self.cond.notify_all();
                    return Some(entry.snapshot(id));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return inner.entries.get(id).map(|e| e.snapshot(id));
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    pub(crate) fn snapshot(&self, id: &str) -> Option<CommandSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(id).map(|e| e.snapshot(id))
    }

    /// Forces pending → expired with the given reason.
    pub(crate) fn expire(&self, id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        if entry.status != QueryStatus::Pending {
            return false;
        }
        entry.finish(QueryStatus::Expired, None, reason.to_string());
        self.cond.notify_all();
        true
    }

    /// Background sweep: pending entries past TTL expire; terminal entries
    /// past retention leave the map. Annotation entries keep the longer
    /// window. Returns (expired, evicted).
    pub(crate) fn reap(&self) -> (usize, usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == QueryStatus::Pending && entry.created.elapsed() > entry.ttl {
                entry.finish(QueryStatus::Expired, None, "ttl elapsed".to_string());
                expired += 1;
            }
        }
        if expired > 0 {
            self.cond.notify_all();
        }
        let retention = self.retention;
        let annotation_retention = self.annotation_retention;
        let before = inner.entries.len();
        inner.entries.retain(|id, entry| match entry.terminal_at {
            Some(at) => {
                let keep_for =
                    if is_annotation_id(id) { annotation_retention } else { retention };
                at.elapsed() <= keep_for
            }
            None => true,
        });
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            let live: Vec<String> =
                inner.order.iter().filter(|id| inner.entries.contains_key(*id)).cloned().collect();
            inner.order = live.into();
            let stale: Vec<String> = inner
                .before_snapshots
                .keys()
                .filter(|id| !inner.entries.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                inner.before_snapshots.remove(&id);
            }
        }
        (expired, evicted)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().filter(|e| e.status == QueryStatus::Pending).count()
    }

    /// 1-based position among pending entries in creation order.
    pub(crate) fn queue_position(&self, id: &str) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter(|queued| {
                inner.entries.get(*queued).map(|e| e.status == QueryStatus::Pending).unwrap_or(false)
            })
            .position(|queued| queued == id)
            .map(|p| p + 1)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    // ── Pilot liveness ──────────────────────────────────────────────────

    pub(crate) fn extension_connected(&self, window: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.active_polls > 0
            || inner.last_sync.map(|at| at.elapsed() <= window).unwrap_or(false)
    }

    pub(crate) fn pilot_source(&self, window: Duration) -> &'static str {
        let inner = self.inner.lock().unwrap();
        if inner.active_polls > 0 {
            return "extension_poll";
        }
        match inner.last_sync {
            Some(at) if at.elapsed() <= window => "extension_poll",
            Some(_) => "stale",
            None => "never_connected",
        }
    }

    pub(crate) fn last_sync_age_ms(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.last_sync.map(|at| at.elapsed().as_millis() as i64)
    }

    pub(crate) fn last_session(&self) -> Option<(String, Option<i64>)> {
        let inner = self.inner.lock().unwrap();
        inner.last_session.clone().map(|s| (s, inner.last_tab))
    }

    /// Best-known URL of the tracked tab, fed by sync bodies, ingested
    /// actions, and navigation results.
    pub(crate) fn note_url(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.last_url = Some(url.to_string());
    }

    pub(crate) fn last_url(&self) -> Option<String> {
        self.inner.lock().unwrap().last_url.clone()
    }

    // ── Before-snapshots (perf-diff) ────────────────────────────────────

    pub(crate) fn put_before_snapshot(&self, id: &str, snapshot: PerformanceSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.before_snapshots.insert(id.to_string(), snapshot);
    }

    /// Get-and-delete: each stashed snapshot is read at most once.
    pub(crate) fn take_before_snapshot(&self, id: &str) -> Option<PerformanceSnapshot> {
        let mut inner = self.inner.lock().unwrap();
        inner.before_snapshots.remove(id)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> CommandRegistry {
        CommandRegistry::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    fn pending(reg: &CommandRegistry, id: &str) {
        reg.create_pending(id, "browser_action", serde_json::json!({}), Duration::from_secs(60));
    }

    #[test]
    fn test_set_result_unblocks_waiter() {
        let reg = Arc::new(registry());
        pending(&reg, "dom_click_1234567890123456_1");
        let poster = Arc::clone(&reg);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            poster.set_result(
                "dom_click_1234567890123456_1",
                Some(serde_json::json!({ "success": true })),
                "",
            );
        });
        let snap = reg
            .wait_for("dom_click_1234567890123456_1", Duration::from_secs(5))
            .expect("entry exists");
        handle.join().unwrap();
        assert_eq!(snap.status, QueryStatus::Complete);
        assert!(snap.result.unwrap()["success"].as_bool().unwrap());
    }

    #[test]
    fn test_concurrent_set_result_first_wins() {
        let reg = Arc::new(registry());
        pending(&reg, "dom_click_1234567890123456_2");
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                reg.set_result(
                    "dom_click_1234567890123456_2",
                    Some(serde_json::json!({ "winner": i })),
                    "",
                )
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|took_effect| *took_effect)
            .count();
        assert_eq!(wins, 1, "exactly one set_result may take effect");
        let snap = reg.snapshot("dom_click_1234567890123456_2").unwrap();
        assert_eq!(snap.status, QueryStatus::Complete);
        assert!(snap.result.unwrap()["winner"].is_number());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let reg = registry();
        pending(&reg, "dom_click_1234567890123456_4");
        assert!(reg.set_result("dom_click_1234567890123456_4", None, "element_not_found"));
        assert!(!reg.set_result("dom_click_1234567890123456_4", Some(serde_json::json!({})), ""));
        assert!(!reg.expire("dom_click_1234567890123456_4", "late"));
        let snap = reg.snapshot("dom_click_1234567890123456_4").unwrap();
        assert_eq!(snap.status, QueryStatus::Error);
        assert_eq!(snap.error, "element_not_found");
    }

    #[test]
    fn test_wait_for_deadline_returns_pending_snapshot() {
        let reg = registry();
        pending(&reg, "dom_click_1234567890123456_5");
        let started = Instant::now();
        let snap = reg
            .wait_for("dom_click_1234567890123456_5", Duration::from_millis(40))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(snap.status, QueryStatus::Pending);
    }

    #[test]
    fn test_wait_for_marks_timeout_past_entry_ttl() {
        let reg = registry();
        reg.create_pending(
            "dom_click_1234567890123456_6",
            "browser_action",
            serde_json::json!({}),
            Duration::from_millis(10),
        );
        std::thread::sleep(Duration::from_millis(20));
        let snap = reg
            .wait_for("dom_click_1234567890123456_6", Duration::from_secs(1))
            .unwrap();
        assert_eq!(snap.status, QueryStatus::Timeout);
    }

    #[test]
    fn test_drain_marks_delivered_once() {
        let reg = registry();
        pending(&reg, "dom_click_1234567890123456_7");
        let batch = reg.drain_for("session-1", Some(4), Duration::from_millis(10));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["correlation_id"], "dom_click_1234567890123456_7");
        assert_eq!(batch[0]["type"], "browser_action");
        let again = reg.drain_for("session-1", Some(4), Duration::from_millis(10));
        assert!(again.is_empty());
    }

    #[test]
    fn test_drain_wakes_on_new_pending() {
        let reg = Arc::new(registry());
        let creator = Arc::clone(&reg);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            creator.create_pending(
                "dom_input_1234567890123456_8",
                "browser_action",
                serde_json::json!({ "selector": "#name" }),
                Duration::from_secs(60),
            );
        });
        let started = Instant::now();
        let batch = reg.drain_for("session-1", None, Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_reap_expires_and_evicts() {
        let reg = CommandRegistry::new(Duration::from_millis(10), Duration::from_secs(600));
        reg.create_pending(
            "dom_click_1234567890123456_9",
            "browser_action",
            serde_json::json!({}),
            Duration::from_millis(5),
        );
        std::thread::sleep(Duration::from_millis(10));
        let (expired, _) = reg.reap();
        assert_eq!(expired, 1);
        assert_eq!(
            reg.snapshot("dom_click_1234567890123456_9").unwrap().status,
            QueryStatus::Expired
        );
        std::thread::sleep(Duration::from_millis(20));
        let (_, evicted) = reg.reap();
        assert_eq!(evicted, 1);
        assert!(reg.snapshot("dom_click_1234567890123456_9").is_none());
    }

    #[test]
    fn test_annotation_entries_outlive_default_retention() {
        let reg = CommandRegistry::new(Duration::from_millis(5), Duration::from_secs(600));
        pending(&reg, "ann_annotate_1234567890123456_1");
        pending(&reg, "dom_click_1234567890123456_10");
        reg.set_result("ann_annotate_1234567890123456_1", None, "");
        reg.set_result("dom_click_1234567890123456_10", None, "");
        std::thread::sleep(Duration::from_millis(15));
        reg.reap();
        assert!(reg.snapshot("ann_annotate_1234567890123456_1").is_some());
        assert!(reg.snapshot("dom_click_1234567890123456_10").is_none());
    }

    #[test]
    fn test_queue_depth_and_position() {
        let reg = registry();
        pending(&reg, "dom_click_1234567890123456_11");
        pending(&reg, "dom_click_1234567890123456_12");
        pending(&reg, "dom_click_1234567890123456_13");
        assert_eq!(reg.queue_depth(), 3);
        assert_eq!(reg.queue_position("dom_click_1234567890123456_12"), Some(2));
        reg.set_result("dom_click_1234567890123456_11", None, "");
        assert_eq!(reg.queue_depth(), 2);
        assert_eq!(reg.queue_position("dom_click_1234567890123456_12"), Some(1));
    }

    #[test]
    fn test_before_snapshot_get_and_delete() {
        let reg = registry();
        let snap: PerformanceSnapshot = serde_json::from_value(serde_json::json!({
            "url": "https://example.com/dashboard",
            "ts": 1000,
            "timing": { "ttfb": 200.0, "dcl": 1000.0, "load": 2000.0 },
        }))
        .unwrap();
        reg.put_before_snapshot("nav_refresh_1234567890123456_1", snap);
        assert!(reg.take_before_snapshot("nav_refresh_1234567890123456_1").is_some());
        assert!(reg.take_before_snapshot("nav_refresh_1234567890123456_1").is_none());
    }

    #[test]
    fn test_parked_long_poll_counts_as_connected() {
        let reg = Arc::new(registry());
        let parked = Arc::clone(&reg);
        let handle = std::thread::spawn(move || {
            parked.drain_for("session-1", None, Duration::from_millis(120));
        });
        std::thread::sleep(Duration::from_millis(60));
        // Well past a 5 ms window, but the poll is still parked.
        assert!(reg.extension_connected(Duration::from_millis(5)));
        assert_eq!(reg.pilot_source(Duration::from_millis(5)), "extension_poll");
        handle.join().unwrap();
        assert!(reg.extension_connected(Duration::from_millis(50)));
    }

    #[test]
    fn test_pilot_source_transitions() {
        let reg = CommandRegistry::new(Duration::from_secs(60), Duration::from_secs(600));
        assert_eq!(reg.pilot_source(Duration::from_millis(20)), "never_connected");
        assert!(!reg.extension_connected(Duration::from_millis(20)));
        reg.drain_for("session-1", None, Duration::from_millis(1));
        assert_eq!(reg.pilot_source(Duration::from_millis(50)), "extension_poll");
        assert!(reg.extension_connected(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(reg.pilot_source(Duration::from_millis(20)), "stale");
    }
}
