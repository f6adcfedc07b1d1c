use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

use crate::{
    now_ms, BufferLimits, EnhancedAction, LogEntry, NetworkBody, PerformanceSnapshot,
    WebSocketEvent,
};

pub(crate) const DEFAULT_QUERY_LIMIT: usize = 50;
pub(crate) const MAX_QUERY_LIMIT: usize = 500;

pub(crate) fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IngestOutcome {
    pub(crate) received: usize,
    pub(crate) rejected: usize,
}

impl IngestOutcome {
    pub(crate) fn to_json(self) -> Value {
        serde_json::json!({ "received": self.received, "rejected": self.rejected })
    }
}

struct Stamped<T> {
    item: T,
    added: Instant,
}

// ── Per-kind read filters ───────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub(crate) struct LogFilter {
    pub(crate) level: Option<String>,
    pub(crate) contains: Option<String>,
    pub(crate) since_ms: Option<i64>,
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct NetworkFilter {
    pub(crate) url_contains: Option<String>,
    pub(crate) method: Option<String>,
    pub(crate) status_min: Option<u16>,
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct WsFilter {
    pub(crate) connection_id: Option<String>,
    pub(crate) direction: Option<String>,
    pub(crate) event: Option<String>,
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ActionFilter {
    pub(crate) action: Option<String>,
    pub(crate) url_contains: Option<String>,
    pub(crate) limit: Option<usize>,
}

// ── Derived WebSocket connection state ──────────────────────────────────

#[derive(Debug, Clone, Default)]
struct DirCounter {
    total: u64,
    bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct WsConnection {
    pub(crate) id: String,
    url: Option<String>,
    state: String,
    opened_ms: i64,
    last_event_ms: i64,
    incoming: DirCounter,
    outgoing: DirCounter,
    last_incoming: Option<(String, i64)>,
    last_outgoing: Option<(String, i64)>,
    close_code: Option<u16>,
    close_reason: Option<String>,
}

impl WsConnection {
    fn rate_json(counter: &DirCounter, opened_ms: i64, now: i64) -> Value {
        let elapsed_s = ((now - opened_ms).max(1_000) as f64) / 1_000.0;
        serde_json::json!({
            "perSecond": counter.total as f64 / elapsed_s,
            "total": counter.total,
            "bytes": counter.bytes,
        })
    }

    fn last_json(last: &Option<(String, i64)>, now: i64) -> Value {
        match last {
            Some((preview, ts)) => serde_json::json!({
                "preview": preview,
                "age_ms": (now - ts).max(0),
            }),
            None => Value::Null,
        }
    }

    fn to_json(&self, now: i64) -> Value {
        let mut out = serde_json::json!({
            "id": self.id,
            "url": self.url,
            "state": self.state,
            "opened_at": self.opened_ms,
            "last_event_at": self.last_event_ms,
            "messageRate": {
                "incoming": Self::rate_json(&self.incoming, self.opened_ms, now),
                "outgoing": Self::rate_json(&self.outgoing, self.opened_ms, now),
            },
            "lastMessage": {
                "incoming": Self::last_json(&self.last_incoming, now),
                "outgoing": Self::last_json(&self.last_outgoing, now),
            },
        });
        if let Some(code) = self.close_code {
            out["close_code"] = serde_json::json!(code);
        }
        if let Some(reason) = &self.close_reason {
            out["close_reason"] = serde_json::json!(reason);
        }
        out
    }
}

#[derive(Default)]
struct WsTable {
    active: Vec<WsConnection>,
    closed: VecDeque<WsConnection>,
}

impl WsTable {
    fn apply(&mut self, event: &WebSocketEvent, active_cap: usize, closed_cap: usize) {
        let ts = crate::parse_rfc3339_ms(&event.ts).unwrap_or_else(now_ms);
        match event.event.as_str() {
            "open" => {
                self.active.retain(|c| c.id != event.connection_id);
                self.active.push(WsConnection {
                    id: event.connection_id.clone(),
                    url: event.url.clone(),
                    state: "open".to_string(),
                    opened_ms: ts,
                    last_event_ms: ts,
                    incoming: DirCounter::default(),
                    outgoing: DirCounter::default(),
                    last_incoming: None,
                    last_outgoing: None,
                    close_code: None,
                    close_reason: None,
                });
                while self.active.len() > active_cap {
                    self.active.remove(0);
                }
            }
            "message" => {
                if let Some(conn) = self.active.iter_mut().find(|c| c.id == event.connection_id) {
                    conn.last_event_ms = ts;
                    let size = event.size.unwrap_or(0);
                    let preview = event.data_preview.clone().unwrap_or_default();
                    match event.direction.as_deref() {
                        Some("outgoing") => {
                            conn.outgoing.total += 1;
                            conn.outgoing.bytes += size;
                            conn.last_outgoing = Some((preview, ts));
                        }
                        _ => {
                            conn.incoming.total += 1;
                            conn.incoming.bytes += size;
                            conn.last_incoming = Some((preview, ts));
                        }
                    }
                }
            }
            "close" | "error" => {
                if let Some(pos) = self.active.iter().position(|c| c.id == event.connection_id) {
                    let mut conn = self.active.remove(pos);
                    conn.state =
                        (if event.event == "error" { "error" } else { "closed" }).to_string();
                    conn.last_event_ms = ts;
                    conn.close_code = event.close_code;
                    conn.close_reason = event.close_reason.clone();
                    self.closed.push_back(conn);
                    while self.closed.len() > closed_cap {
                        self.closed.pop_front();
                    }
                }
            }
            _ => {}
        }
    }
}

// ── Screenshot rate gate ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScreenshotGate {
    Admitted,
    RateLimited,
    TableFull,
}

// ── Telemetry buffers (C1) ──────────────────────────────────────────────

/// Bounded concurrent stores for everything the extension ships. Each kind
/// sits behind its own mutex; reads return deep copies and writers mutate
/// in place. Eviction on append runs ring cap, then TTL cut, then (for the
/// byte-accounted kinds) budget cut, in that order.
pub(crate) struct TelemetryBuffers {
    limits: BufferLimits,
    logs: Mutex<VecDeque<Stamped<LogEntry>>>,
    network: Mutex<VecDeque<Stamped<NetworkBody>>>,
    ws_events: Mutex<VecDeque<Stamped<WebSocketEvent>>>,
    ws_table: Mutex<WsTable>,
    performance: Mutex<HashMap<String, PerformanceSnapshot>>,
    actions: Mutex<VecDeque<Stamped<EnhancedAction>>>,
    screenshot_gate: Mutex<HashMap<String, Instant>>,
}

fn ring_and_ttl<T>(buf: &mut VecDeque<Stamped<T>>, cap: usize, ttl: std::time::Duration) {
    while buf.len() > cap {
        buf.pop_front();
    }
    let now = Instant::now();
    while let Some(front) = buf.front() {
        if now.duration_since(front.added) > ttl {
            buf.pop_front();
        } else {
            break;
        }
    }
}

impl TelemetryBuffers {
    pub(crate) fn new(limits: BufferLimits) -> TelemetryBuffers {
        TelemetryBuffers {
            limits,
            logs: Mutex::new(VecDeque::new()),
            network: Mutex::new(VecDeque::new()),
            ws_events: Mutex::new(VecDeque::new()),
            ws_table: Mutex::new(WsTable::default()),
            performance: Mutex::new(HashMap::new()),
            actions: Mutex::new(VecDeque::new()),
            screenshot_gate: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn limits(&self) -> &BufferLimits {
        &self.limits
    }

    // ── Appends ─────────────────────────────────────────────────────────

    pub(crate) fn append_logs(&self, items: &[Value]) -> IngestOutcome {
        let mut buf = self.logs.lock().unwrap();
        let mut received = 0;
        let mut rejected = 0;
        for raw in items {
            match serde_json::from_value::<LogEntry>(raw.clone()) {
                Ok(entry) if entry.validate().is_ok() => {
                    buf.push_back(Stamped { item: entry, added: Instant::now() });
                    received += 1;
                }
                _ => rejected += 1,
            }
        }
        ring_and_ttl(&mut buf, self.limits.max_log_entries, self.limits.log_ttl);
        IngestOutcome { received, rejected }
    }

    pub(crate) fn append_network(&self, items: &[Value]) -> IngestOutcome {
        let mut buf = self.network.lock().unwrap();
        let mut received = 0;
        let mut rejected = 0;
        for raw in items {
            let mut body = match serde_json::from_value::<NetworkBody>(raw.clone()) {
                Ok(body) if !body.url.is_empty() && !body.method.is_empty() => body,
                _ => {
                    rejected += 1;
                    continue;
                }
            };
            if let Some(preview) = &mut body.body_preview {
                if preview.len() > self.limits.network_preview_cap {
                    let mut cut = self.limits.network_preview_cap;
                    while !preview.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    preview.truncate(cut);
                }
            }
            // A body larger than the whole budget can never be held. The
            // budget sweep would have drained every older entry making room
            // for it, so that eviction still happens before the rejection.
            if body.cost() > self.limits.network_budget_bytes
                || body.size as usize > self.limits.network_budget_bytes
            {
                buf.clear();
                rejected += 1;
                continue;
            }
            buf.push_back(Stamped { item: body, added: Instant::now() });
            received += 1;
        }
        ring_and_ttl(&mut buf, usize::MAX, self.limits.network_ttl);
        let mut total: usize = buf.iter().map(|s| s.item.cost()).sum();
        while total > self.limits.network_budget_bytes {
            match buf.pop_front() {
                Some(evicted) => total -= evicted.item.cost(),
                None => break,
            }
        }
        IngestOutcome { received, rejected }
    }

    pub(crate) fn append_ws_events(&self, items: &[Value]) -> IngestOutcome {
        let mut buf = self.ws_events.lock().unwrap();
        let mut table = self.ws_table.lock().unwrap();
        let mut received = 0;
        let mut rejected = 0;
        for raw in items {
            match serde_json::from_value::<WebSocketEvent>(raw.clone()) {
                Ok(event) if event.validate().is_ok() => {
                    table.apply(&event, self.limits.ws_active_cap, self.limits.ws_closed_cap);
                    buf.push_back(Stamped { item: event, added: Instant::now() });
                    received += 1;
                }
                _ => rejected += 1,
            }
        }
        ring_and_ttl(&mut buf, self.limits.ws_ring, self.limits.log_ttl);
        IngestOutcome { received, rejected }
    }

    pub(crate) fn append_performance(&self, items: &[Value]) -> IngestOutcome {
        let mut map = self.performance.lock().unwrap();
        let mut received = 0;
        let mut rejected = 0;
        for raw in items {
            match serde_json::from_value::<PerformanceSnapshot>(raw.clone()) {
                Ok(snap) if !snap.url.is_empty() && snap.ts > 0 => {
                    let key = url_path_key(&snap.url);
                    map.insert(key, snap);
                    received += 1;
                }
                _ => rejected += 1,
            }
        }
        IngestOutcome { received, rejected }
    }

    pub(crate) fn append_actions(&self, items: &[Value]) -> IngestOutcome {
        let mut buf = self.actions.lock().unwrap();
        let mut received = 0;
        let mut rejected = 0;
        for raw in items {
            match serde_json::from_value::<EnhancedAction>(raw.clone()) {
                Ok(action) if action.validate().is_ok() => {
                    buf.push_back(Stamped { item: action, added: Instant::now() });
                    received += 1;
                }
                _ => rejected += 1,
            }
        }
        ring_and_ttl(&mut buf, self.limits.max_actions, self.limits.action_ttl);
        IngestOutcome { received, rejected }
    }

    // ── Reads (newest first, deep copies) ───────────────────────────────

    pub(crate) fn query_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let buf = self.logs.lock().unwrap();
        let limit = clamp_limit(filter.limit);
        buf.iter()
            .rev()
            .filter(|s| {
                let e = &s.item;
                filter.level.as_deref().is_none_or(|l| e.level == l)
                    && filter.contains.as_deref().is_none_or(|c| e.message.contains(c))
                    && filter
                        .since_ms
                        .is_none_or(|since| crate::parse_rfc3339_ms(&e.ts).unwrap_or(0) >= since)
            })
            .take(limit)
            .map(|s| s.item.clone())
            .collect()
    }

    pub(crate) fn query_network(&self, filter: &NetworkFilter) -> Vec<NetworkBody> {
        let buf = self.network.lock().unwrap();
        let limit = clamp_limit(filter.limit);
        buf.iter()
            .rev()
            .filter(|s| {
                let b = &s.item;
                filter.url_contains.as_deref().is_none_or(|u| b.url.contains(u))
                    && filter
                        .method
                        .as_deref()
                        .is_none_or(|m| b.method.eq_ignore_ascii_case(m))
                    && filter.status_min.is_none_or(|min| b.status >= min)
            })
            .take(limit)
            .map(|s| s.item.clone())
            .collect()
    }

    pub(crate) fn query_ws_events(&self, filter: &WsFilter) -> Vec<WebSocketEvent> {
        let buf = self.ws_events.lock().unwrap();
        let limit = clamp_limit(filter.limit);
        buf.iter()
            .rev()
            .filter(|s| {
                let e = &s.item;
                filter
                    .connection_id
                    .as_deref()
                    .is_none_or(|id| e.connection_id == id)
                    && filter
                        .direction
                        .as_deref()
                        .is_none_or(|d| e.direction.as_deref() == Some(d))
                    && filter.event.as_deref().is_none_or(|k| e.event == k)
            })
            .take(limit)
            .map(|s| s.item.clone())
            .collect()
    }

    pub(crate) fn query_actions(&self, filter: &ActionFilter) -> Vec<EnhancedAction> {
        let buf = self.actions.lock().unwrap();
        let limit = clamp_limit(filter.limit);
        buf.iter()
            .rev()
            .filter(|s| {
                let a = &s.item;
                filter.action.as_deref().is_none_or(|k| a.action == k)
                    && filter.url_contains.as_deref().is_none_or(|u| a.url.contains(u))
            })
            .take(limit)
            .map(|s| s.item.clone())
            .collect()
    }

    pub(crate) fn latest_performance(&self, path_key: &str) -> Option<PerformanceSnapshot> {
        self.performance.lock().unwrap().get(path_key).cloned()
    }

    pub(crate) fn performance_snapshots(&self) -> Vec<PerformanceSnapshot> {
        let map = self.performance.lock().unwrap();
        let mut snaps: Vec<PerformanceSnapshot> = map.values().cloned().collect();
        snaps.sort_by_key(|s| std::cmp::Reverse(s.ts));
        snaps
    }

    pub(crate) fn ws_status(&self) -> Value {
        let table = self.ws_table.lock().unwrap();
        let now = now_ms();
        serde_json::json!({
            "connections": table.active.iter().map(|c| c.to_json(now)).collect::<Vec<_>>(),
            "closed": table.closed.iter().map(|c| c.to_json(now)).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn counts(&self) -> Value {
        serde_json::json!({
            "console_logs": self.logs.lock().unwrap().len(),
            "network_bodies": self.network.lock().unwrap().len(),
            "websocket_events": self.ws_events.lock().unwrap().len(),
            "performance_snapshots": self.performance.lock().unwrap().len(),
            "actions": self.actions.lock().unwrap().len(),
        })
    }

    // ── Destructive ─────────────────────────────────────────────────────

    /// Clears the named kinds and reports pre-clear counts per kind.
    pub(crate) fn clear(&self, kinds: &[String]) -> HashMap<String, usize> {
        let mut cleared = HashMap::new();
        for kind in kinds {
            let count = match kind.as_str() {
                "logs" => {
                    let mut buf = self.logs.lock().unwrap();
                    let n = buf.len();
                    buf.clear();
                    n
                }
                "network" => {
                    let mut buf = self.network.lock().unwrap();
                    let n = buf.len();
                    buf.clear();
                    n
                }
                "websocket" => {
                    let mut buf = self.ws_events.lock().unwrap();
                    let n = buf.len();
                    buf.clear();
                    let mut table = self.ws_table.lock().unwrap();
                    table.active.clear();
                    table.closed.clear();
                    n
                }
                "performance" => {
                    let mut map = self.performance.lock().unwrap();
                    let n = map.len();
                    map.clear();
                    n
                }
                "actions" => {
                    let mut buf = self.actions.lock().unwrap();
                    let n = buf.len();
                    buf.clear();
                    n
                }
                _ => continue,
            };
            cleared.insert(kind.clone(), count);
        }
        cleared
    }

    // ── Screenshot rate gate ────────────────────────────────────────────

    /// At most one screenshot per second per client. The table is bounded;
    /// when full, unknown clients are refused until TTL pruning frees slots,
    /// while known clients keep their rate gate.
    pub(crate) fn screenshot_admit(&self, client_id: &str) -> ScreenshotGate {
        let mut gate = self.screenshot_gate.lock().unwrap();
        let now = Instant::now();
        if gate.len() >= self.limits.screenshot_table_cap {
            let ttl = self.limits.screenshot_entry_ttl;
            gate.retain(|_, last| now.duration_since(*last) < ttl);
        }
        match gate.get(client_id).copied() {
            Some(last) if now.duration_since(last) < self.limits.screenshot_min_interval => {
                ScreenshotGate::RateLimited
            }
            Some(_) => {
                gate.insert(client_id.to_string(), now);
                ScreenshotGate::Admitted
            }
            None if gate.len() >= self.limits.screenshot_table_cap => ScreenshotGate::TableFull,
            None => {
                gate.insert(client_id.to_string(), now);
                ScreenshotGate::Admitted
            }
        }
    }
}

/// Performance snapshots key on the URL path so reloads of the same page
/// overwrite rather than accumulate.
pub(crate) fn url_path_key(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
