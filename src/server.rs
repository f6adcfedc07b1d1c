use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::Value;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::{
    handle_rpc, lifecycle_log_path, parse_rpc_frame, remove_pid_file, write_pid_file,
    CommandRegistry, DaemonConfig, DebugRing, LifecycleLog, NoiseRule, RetryTable,
    TelemetryBuffers,
};

/// Client identity header; also gates `/shutdown`.
pub(crate) const CLIENT_HEADER: &str = "X-Gasoline-Client";
/// Shared-secret header checked on `/mcp` when an API key is configured.
pub(crate) const KEY_HEADER: &str = "X-Gasoline-Key";

const DEBUG_RING_CAP: usize = 256;
const WORKER_THREADS: usize = 4;

// ── WS ingest circuit breaker ───────────────────────────────────────────

struct WsCircuit {
    window_start: Instant,
    count: u32,
    open_until: Option<Instant>,
}

impl WsCircuit {
    fn new() -> WsCircuit {
        WsCircuit { window_start: Instant::now(), count: 0, open_until: None }
    }

    fn admit(&mut self, threshold: u32, cooldown: Duration) -> bool {
        let now = Instant::now();
        if let Some(until) = self.open_until {
            if now < until {
                return false;
            }
            self.open_until = None;
            self.count = 0;
            self.window_start = now;
        }
        if now.duration_since(self.window_start) > Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        if self.count > threshold {
            self.open_until = Some(now + cooldown);
            return false;
        }
        true
    }
}

// ── Daemon ──────────────────────────────────────────────────────────────

/// All long-lived state, built once at startup and shared by worker
/// threads and tool handlers. Everything mutable sits behind its own lock;
/// nothing here is a process-wide singleton, so tests construct as many
/// daemons as they like.
pub(crate) struct Daemon {
    pub(crate) config: DaemonConfig,
    pub(crate) buffers: TelemetryBuffers,
    pub(crate) registry: CommandRegistry,
    pub(crate) retries: RetryTable,
    pub(crate) lifecycle: LifecycleLog,
    pub(crate) debug_ring: DebugRing,
    pub(crate) noise_rules: Mutex<Vec<NoiseRule>>,
    pub(crate) started: Instant,
    ws_circuit: Mutex<WsCircuit>,
    shutdown: AtomicBool,
}

impl Daemon {
    pub(crate) fn new(config: DaemonConfig) -> Daemon {
        let lifecycle = LifecycleLog::start(lifecycle_log_path(
            &config.state_dir,
            config.log_file.as_deref(),
        ));
        Daemon {
            buffers: TelemetryBuffers::new(config.limits.clone()),
            registry: CommandRegistry::new(
                config.timings.retention,
                config.timings.annotation_retention,
            ),
            retries: RetryTable::new(config.timings.retry_table_cap),
            lifecycle,
            debug_ring: DebugRing::new(DEBUG_RING_CAP),
            noise_rules: Mutex::new(Vec::new()),
            started: Instant::now(),
            ws_circuit: Mutex::new(WsCircuit::new()),
            shutdown: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

// ── Daemon entry point ──────────────────────────────────────────────────

pub(crate) fn run_daemon(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.port;
    let state_dir = config.state_dir.clone();
    let daemon = Arc::new(Daemon::new(config));
    let addr = format!("127.0.0.1:{port}");
    let server = Arc::new(
        Server::http(&addr)
            .map_err(|e| std::io::Error::other(format!("bind {addr}: {e}")))?,
    );
    write_pid_file(&state_dir, port)?;
    daemon.lifecycle.event(
        "daemon_start",
        serde_json::json!({
            "port": port,
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    );
    eprintln!("[daemon] listening on http://{addr}");

    // Registry reaper: fixed-cadence TTL and retention sweep.
    {
        let daemon = Arc::clone(&daemon);
        std::thread::spawn(move || {
            while !daemon.shutdown_requested() {
                daemon.registry.reap();
                std::thread::sleep(daemon.config.timings.reap_interval);
            }
        });
    }

    let mut workers = Vec::new();
    for _ in 0..WORKER_THREADS {
        let daemon = Arc::clone(&daemon);
        let server = Arc::clone(&server);
        workers.push(std::thread::spawn(move || worker_loop(&daemon, &server)));
    }
    for worker in workers {
        let _ = worker.join();
    }

    daemon.lifecycle.event("daemon_stop", serde_json::json!({ "port": port }));
    remove_pid_file(&state_dir, port);
    Ok(())
}

pub(crate) fn worker_loop(daemon: &Arc<Daemon>, server: &Arc<Server>) {
    loop {
        if daemon.shutdown_requested() {
            server.unblock();
            return;
        }
        match server.recv() {
            Ok(request) => handle_request(daemon, server, request),
            Err(_) => return,
        }
    }
}

// ── Request plumbing ────────────────────────────────────────────────────

fn respond_json(daemon: &Daemon, request: Request, status: u16, body: &Value) {
    let line = format!("{} {} status={status}", request.method(), request.url());
    daemon.debug_ring.record(&line);
    let mut response = Response::from_string(serde_json::to_string(body).unwrap_or_default())
        .with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response.add_header(header);
    }
    let _ = request.respond(response);
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_string())
}

/// Reads the body up to the configured cap. `Err` means oversize.
fn read_body(request: &mut Request, cap: usize) -> Result<String, ()> {
    if request.body_length().map(|len| len > cap).unwrap_or(false) {
        return Err(());
    }
    let mut body = String::new();
    let mut reader = request.as_reader().take(cap as u64 + 1);
    if reader.read_to_string(&mut body).is_err() {
        return Ok(String::new());
    }
    if body.len() > cap {
        return Err(());
    }
    Ok(body)
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.splitn(2, '?').nth(1)?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn bad_request(code: &str, message: &str) -> Value {
    serde_json::json!({ "error": code, "message": message })
}

pub(crate) fn handle_request(daemon: &Arc<Daemon>, server: &Arc<Server>, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("/").to_string();

    match (&method, path.as_str()) {
        (Method::Get, "/health") => {
            let payload = health_payload(daemon);
            respond_json(daemon, request, 200, &payload);
        }
        (Method::Get, "/diagnostics") => {
            let entries = daemon.debug_ring.snapshot();
            respond_json(
                daemon,
                request,
                200,
                &serde_json::json!({ "count": entries.len(), "entries": entries }),
            );
        }
        (Method::Post, "/logs") => handle_ingest(daemon, request, "entries", |d, items| {
            d.buffers.append_logs(items)
        }),
        (Method::Delete, "/logs") => {
            let cleared = daemon.buffers.clear(&["logs".to_string()]);
            respond_json(
                daemon,
                request,
                200,
                &serde_json::json!({ "cleared": cleared.get("logs").copied().unwrap_or(0) }),
            );
        }
        (Method::Post, "/screenshots") => handle_screenshot(daemon, request),
        (Method::Get, "/websocket-events") => {
            let filter = crate::WsFilter {
                connection_id: query_param(&url, "connection_id"),
                direction: query_param(&url, "direction"),
                event: query_param(&url, "event"),
                limit: query_param(&url, "limit").and_then(|v| v.parse().ok()),
            };
            let events = daemon.buffers.query_ws_events(&filter);
            respond_json(
                daemon,
                request,
                200,
                &serde_json::json!({ "count": events.len(), "events": events }),
            );
        }
        (Method::Post, "/websocket-events") => handle_ws_events(daemon, request),
        (Method::Get, "/websocket-status") => {
            let status = daemon.buffers.ws_status();
            respond_json(daemon, request, 200, &status);
        }
        (Method::Post, "/performance") => handle_performance(daemon, request),
        (Method::Post, "/sync") => handle_sync(daemon, request),
        (Method::Post, _) if path.starts_with("/commands/") && path.ends_with("/result") => {
            let id = path
                .trim_start_matches("/commands/")
                .trim_end_matches("/result")
                .to_string();
            handle_command_result(daemon, request, &id);
        }
        (Method::Post, "/mcp") => handle_mcp(daemon, request),
        (Method::Post, "/shutdown") => {
            if header_value(&request, CLIENT_HEADER).is_none() {
                respond_json(
                    daemon,
                    request,
                    403,
                    &bad_request("missing_param", "shutdown requires the X-Gasoline-Client header"),
                );
                return;
            }
            daemon.lifecycle.event("shutdown_requested", serde_json::json!({}));
            respond_json(daemon, request, 200, &serde_json::json!({ "status": "shutting_down" }));
            daemon.request_shutdown();
            for _ in 0..WORKER_THREADS {
                server.unblock();
            }
        }
        _ => {
            respond_json(daemon, request, 404, &bad_request("not_found", "no such endpoint"));
        }
    }
}

// ── Endpoint handlers ───────────────────────────────────────────────────

fn handle_ingest(
    daemon: &Arc<Daemon>,
    mut request: Request,
    field: &str,
    append: impl Fn(&Daemon, &[Value]) -> crate::IngestOutcome,
) {
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(
                daemon,
                request,
                413,
                &bad_request("batch_too_large", "body exceeds the 10 MiB ingest cap"),
            );
            return;
        }
    };
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("invalid_json", &format!("body is not JSON: {err}")),
            );
            return;
        }
    };
    let items: Vec<Value> = match parsed.get(field) {
        Some(Value::Array(items)) => items.clone(),
        _ => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("missing_param", &format!("expected a '{field}' array")),
            );
            return;
        }
    };
    let outcome = append(daemon, &items);
    respond_json(daemon, request, 200, &outcome.to_json());
}

fn handle_ws_events(daemon: &Arc<Daemon>, mut request: Request) {
    {
        let mut circuit = daemon.ws_circuit.lock().unwrap();
        if !circuit.admit(daemon.config.ws_circuit_threshold, daemon.config.ws_circuit_cooldown) {
            drop(circuit);
            respond_json(
                daemon,
                request,
                429,
                &bad_request("circuit_open", "websocket ingest is cooling down; retry shortly"),
            );
            return;
        }
    }
    handle_ingest(daemon, request, "events", |d, items| d.buffers.append_ws_events(items));
}

fn handle_performance(daemon: &Arc<Daemon>, mut request: Request) {
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(
                daemon,
                request,
                413,
                &bad_request("batch_too_large", "body exceeds the 10 MiB ingest cap"),
            );
            return;
        }
    };
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("invalid_json", &format!("body is not JSON: {err}")),
            );
            return;
        }
    };
    // Accepts either a single snapshot or a batch.
    let items: Vec<Value> = if let Some(Value::Array(items)) = parsed.get("snapshots") {
        items.clone()
    } else if parsed.is_object() {
        vec![parsed]
    } else {
        respond_json(
            daemon,
            request,
            400,
            &bad_request("missing_param", "expected a snapshot object or 'snapshots' array"),
        );
        return;
    };
    for item in &items {
        if let Some(url) = item.get("url").and_then(|v| v.as_str()) {
            daemon.registry.note_url(url);
        }
    }
    let outcome = daemon.buffers.append_performance(&items);
    respond_json(daemon, request, 200, &outcome.to_json());
}

fn handle_sync(daemon: &Arc<Daemon>, mut request: Request) {
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(daemon, request, 413, &bad_request("batch_too_large", "oversize body"));
            return;
        }
    };
    let parsed: Value = serde_json::from_str(&body).unwrap_or_else(|_| serde_json::json!({}));
    let Some(session_id) = parsed.get("session_id").and_then(|v| v.as_str()) else {
        respond_json(daemon, request, 400, &bad_request("missing_param", "session_id is required"));
        return;
    };
    let tab_id = parsed.get("tab_id").and_then(|v| v.as_i64());
    if let Some(url) = parsed.get("url").and_then(|v| v.as_str()) {
        daemon.registry.note_url(url);
    }
    let max_wait = daemon.config.timings.long_poll_max.min(Duration::from_secs(25));
    let commands = daemon.registry.drain_for(session_id, tab_id, max_wait);
    respond_json(
        daemon,
        request,
        200,
        &serde_json::json!({
            "session_id": session_id,
            "commands": commands,
            "queue_depth": daemon.registry.queue_depth(),
        }),
    );
}

fn handle_command_result(daemon: &Arc<Daemon>, mut request: Request, id: &str) {
    if !crate::is_valid_correlation_id(id) {
        respond_json(
            daemon,
            request,
            400,
            &bad_request("invalid_param", "malformed correlation ID"),
        );
        return;
    }
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(daemon, request, 413, &bad_request("batch_too_large", "oversize body"));
            return;
        }
    };
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("invalid_json", &format!("body is not JSON: {err}")),
            );
            return;
        }
    };
    let success = parsed.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    let error = if success {
        String::new()
    } else {
        parsed
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("command_failed")
            .to_string()
    };
    let result = parsed.get("result").cloned().unwrap_or(parsed.clone());
    if let Some(url) = result
        .get("final_url")
        .or_else(|| result.get("resolved_url"))
        .and_then(|v| v.as_str())
    {
        daemon.registry.note_url(url);
    }
    if daemon.registry.set_result(id, Some(result), &error) {
        respond_json(daemon, request, 200, &serde_json::json!({ "accepted": true }));
    } else {
        respond_json(
            daemon,
            request,
            404,
            &bad_request("invalid_param", "unknown or already-terminal correlation ID"),
        );
    }
}

fn handle_screenshot(daemon: &Arc<Daemon>, mut request: Request) {
    let client_id = header_value(&request, CLIENT_HEADER);
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(daemon, request, 413, &bad_request("batch_too_large", "oversize body"));
            return;
        }
    };
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("invalid_json", &format!("body is not JSON: {err}")),
            );
            return;
        }
    };
    let client_id = client_id
        .or_else(|| parsed.get("client_id").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| "default".to_string());
    match daemon.buffers.screenshot_admit(&client_id) {
        crate::ScreenshotGate::RateLimited => {
            respond_json(
                daemon,
                request,
                429,
                &bad_request("rate_limited", "screenshots are limited to one per second per client"),
            );
            return;
        }
        crate::ScreenshotGate::TableFull => {
            respond_json(
                daemon,
                request,
                503,
                &bad_request("rate_limited", "screenshot rate-limit table is full; retry shortly"),
            );
            return;
        }
        crate::ScreenshotGate::Admitted => {}
    }

    let Some(data_url) = parsed.get("data_url").and_then(|v| v.as_str()) else {
        respond_json(daemon, request, 400, &bad_request("missing_param", "data_url is required"));
        return;
    };
    let Some(encoded) = data_url.strip_prefix("data:image/").and_then(|rest| {
        rest.split_once(";base64,").map(|(_, payload)| payload)
    }) else {
        respond_json(
            daemon,
            request,
            400,
            &bad_request("invalid_param", "data_url must be a base64 image data URL"),
        );
        return;
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(err) => {
            respond_json(
                daemon,
                request,
                400,
                &bad_request("invalid_param", &format!("data_url payload is not base64: {err}")),
            );
            return;
        }
    };

    if let Some(url) = parsed.get("url").and_then(|v| v.as_str()) {
        daemon.registry.note_url(url);
    }

    let dir = daemon.config.state_dir.join("screenshots");
    if let Err(err) = std::fs::create_dir_all(&dir) {
        respond_json(
            daemon,
            request,
            500,
            &bad_request("internal", &format!("cannot create screenshot dir: {err}")),
        );
        return;
    }
    let name = format!("{}.png", crate::mint_correlation_id("screenshot"));
    let path = dir.join(name);
    if let Err(err) = std::fs::write(&path, &bytes) {
        respond_json(
            daemon,
            request,
            500,
            &bad_request("internal", &format!("screenshot write failed: {err}")),
        );
        return;
    }

    // A screenshot can be the answer to a pending command.
    let correlation = parsed
        .get("correlation_id")
        .or_else(|| parsed.get("query_id"))
        .and_then(|v| v.as_str());
    if let Some(id) = correlation {
        daemon.registry.set_result(
            id,
            Some(serde_json::json!({
                "success": true,
                "screenshot_path": path.display().to_string(),
            })),
            "",
        );
    }

    respond_json(
        daemon,
        request,
        200,
        &serde_json::json!({ "saved": true, "path": path.display().to_string(), "bytes": bytes.len() }),
    );
}

fn handle_mcp(daemon: &Arc<Daemon>, mut request: Request) {
    if let Some(expected) = &daemon.config.api_key {
        if header_value(&request, KEY_HEADER).as_deref() != Some(expected.as_str()) {
            respond_json(
                daemon,
                request,
                401,
                &bad_request("invalid_param", "missing or wrong shared secret"),
            );
            return;
        }
    }
    let body = match read_body(&mut request, daemon.config.max_body_bytes) {
        Ok(body) => body,
        Err(()) => {
            respond_json(daemon, request, 413, &bad_request("batch_too_large", "oversize body"));
            return;
        }
    };
    let frame = match parse_rpc_frame(&body) {
        Ok(frame) => frame,
        Err(envelope) => {
            respond_json(daemon, request, 200, &envelope);
            return;
        }
    };
    match handle_rpc(daemon, &frame) {
        Some(response) => respond_json(daemon, request, 200, &response),
        // Notifications: JSON null means "nothing to put on the wire".
        None => respond_json(daemon, request, 200, &Value::Null),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

pub(crate) fn health_payload(daemon: &Daemon) -> Value {
    let window = daemon.config.timings.liveness_window;
    let connected = daemon.registry.extension_connected(window);
    let source = daemon.registry.pilot_source(window);
    let dropped = daemon.lifecycle.dropped_count();
    let mut warnings: Vec<String> = Vec::new();
    if dropped > 0 {
        warnings.push(format!("lifecycle log dropped {dropped} event(s)"));
    }
    if source == "stale" {
        warnings.push("extension poll is stale; commands will fail fast with no_data".to_string());
    }
    let mut pilot = serde_json::json!({
        "enabled": connected,
        "source": source,
        "extension_connected": connected,
    });
    if let Some((session, tab)) = daemon.registry.last_session() {
        pilot["session_id"] = serde_json::json!(session);
        if let Some(tab) = tab {
            pilot["tab_id"] = serde_json::json!(tab);
        }
    }
    serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": daemon.started.elapsed().as_millis() as u64,
        "buffers": daemon.buffers.counts(),
        "retry_states": daemon.retries.len(),
        "logs": {
            "dropped_count": dropped,
            "path": daemon.lifecycle.path().display().to_string(),
        },
        "pilot": pilot,
        "queue_depth": daemon.registry.queue_depth(),
        "warnings": warnings,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DispatchTimings;
    use std::net::SocketAddr;

    fn test_daemon(name: &str) -> Arc<Daemon> {
        let state_dir = std::env::temp_dir()
            .join("gasoline_test")
            .join(format!("server_{}_{name}", std::process::id()));
        let mut config = DaemonConfig::resolve(Some(0), Some(state_dir), None, None, None);
        config.timings = DispatchTimings {
            long_poll_max: Duration::from_millis(40),
            liveness_window: Duration::from_secs(5),
            ..DispatchTimings::default()
        };
        Arc::new(Daemon::new(config))
    }

    fn spawn_server(daemon: &Arc<Daemon>) -> SocketAddr {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        for _ in 0..2 {
            let daemon = Arc::clone(daemon);
            let server = Arc::clone(&server);
            std::thread::spawn(move || worker_loop(&daemon, &server));
        }
        addr
    }

    fn agent() -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(2))
            .timeout_read(Duration::from_secs(5))
            .build()
    }

    #[test]
    fn test_health_is_side_effect_free() {
        let daemon = test_daemon("health");
        let addr = spawn_server(&daemon);
        let resp = agent().get(&format!("http://{addr}/health")).call().unwrap();
        assert_eq!(resp.status(), 200);
        let health: Value = resp.into_json().unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pilot"]["source"], "never_connected");
        assert_eq!(health["logs"]["dropped_count"], 0);
        assert!(health["warnings"].as_array().unwrap().len() <= 1);
    }

    #[test]
    fn test_log_ingest_and_parse_failure() {
        let daemon = test_daemon("logs");
        let addr = spawn_server(&daemon);
        let resp = agent()
            .post(&format!("http://{addr}/logs"))
            .send_string(
                &serde_json::json!({
                    "entries": [
                        { "level": "info", "message": "hello", "ts": chrono::Utc::now().to_rfc3339() },
                        { "level": "shout", "message": "bad", "ts": "zzz" },
                    ]
                })
                .to_string(),
            )
            .unwrap();
        let outcome: Value = resp.into_json().unwrap();
        assert_eq!(outcome["received"], 1);
        assert_eq!(outcome["rejected"], 1);

        let err = agent()
            .post(&format!("http://{addr}/logs"))
            .send_string("{not json")
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 400),
            other => panic!("expected 400, got {other}"),
        }
        // The broken body never touched the buffer.
        assert_eq!(daemon.buffers.counts()["console_logs"], 1);
    }

    #[test]
    fn test_logs_delete_clears() {
        let daemon = test_daemon("logs_delete");
        let addr = spawn_server(&daemon);
        daemon.buffers.append_logs(&[serde_json::json!({
            "level": "info", "message": "x", "ts": chrono::Utc::now().to_rfc3339(),
        })]);
        let resp = agent().delete(&format!("http://{addr}/logs")).call().unwrap();
        let body: Value = resp.into_json().unwrap();
        assert_eq!(body["cleared"], 1);
    }

    #[test]
    fn test_sync_delivers_queued_commands_and_updates_pilot() {
        let daemon = test_daemon("sync");
        let addr = spawn_server(&daemon);
        daemon.registry.create_pending(
            "dom_click_1234567890123456_1",
            "browser_action",
            serde_json::json!({ "selector": "#btn" }),
            Duration::from_secs(30),
        );
        let resp = agent()
            .post(&format!("http://{addr}/sync"))
            .send_string(&serde_json::json!({ "session_id": "s-1", "tab_id": 7 }).to_string())
            .unwrap();
        let body: Value = resp.into_json().unwrap();
        assert_eq!(body["commands"].as_array().unwrap().len(), 1);
        assert_eq!(body["commands"][0]["correlation_id"], "dom_click_1234567890123456_1");
        assert!(daemon.registry.extension_connected(Duration::from_secs(2)));

        // Missing session_id is a 400.
        let err = agent()
            .post(&format!("http://{addr}/sync"))
            .send_string("{}")
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 400),
            other => panic!("expected 400, got {other}"),
        }
    }

    #[test]
    fn test_command_result_transitions_entry() {
        let daemon = test_daemon("cmd_result");
        let addr = spawn_server(&daemon);
        daemon.registry.create_pending(
            "dom_click_1234567890123456_2",
            "browser_action",
            serde_json::json!({}),
            Duration::from_secs(30),
        );
        let resp = agent()
            .post(&format!("http://{addr}/commands/dom_click_1234567890123456_2/result"))
            .send_string(
                &serde_json::json!({ "success": true, "result": { "final_url": "https://x.test/" } })
                    .to_string(),
            )
            .unwrap();
        assert_eq!(resp.status(), 200);
        let snap = daemon.registry.snapshot("dom_click_1234567890123456_2").unwrap();
        assert_eq!(snap.status, crate::QueryStatus::Complete);
        assert_eq!(daemon.registry.last_url().as_deref(), Some("https://x.test/"));

        let err = agent()
            .post(&format!("http://{addr}/commands/dom_click_1234567890123456_99/result"))
            .send_string(&serde_json::json!({ "success": true }).to_string())
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 404),
            other => panic!("expected 404, got {other}"),
        }

        // IDs missing a numeric segment never reach the registry.
        let err = agent()
            .post(&format!("http://{addr}/commands/dom_click_oops/result"))
            .send_string(&serde_json::json!({ "success": true }).to_string())
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 400),
            other => panic!("expected 400, got {other}"),
        }
    }

    #[test]
    fn test_screenshot_rate_limit_roundtrip() {
        let daemon = test_daemon("screenshot");
        let addr = spawn_server(&daemon);
        let body = serde_json::json!({
            "data_url": "data:image/png;base64,aGVsbG8=",
            "url": "https://example.com/page",
        })
        .to_string();
        let post = || {
            agent()
                .post(&format!("http://{addr}/screenshots"))
                .set(CLIENT_HEADER, "client-a")
                .send_string(&body)
        };
        let first = post().unwrap();
        assert_eq!(first.status(), 200);
        let saved: Value = first.into_json().unwrap();
        assert_eq!(saved["saved"], true);
        match post().unwrap_err() {
            ureq::Error::Status(code, _) => assert_eq!(code, 429),
            other => panic!("expected 429, got {other}"),
        }
    }

    #[test]
    fn test_screenshot_bad_data_url() {
        let daemon = test_daemon("screenshot_bad");
        let addr = spawn_server(&daemon);
        let err = agent()
            .post(&format!("http://{addr}/screenshots"))
            .set(CLIENT_HEADER, "client-b")
            .send_string(&serde_json::json!({ "data_url": "nope" }).to_string())
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 400),
            other => panic!("expected 400, got {other}"),
        }
    }

    #[test]
    fn test_screenshot_resolves_pending_command() {
        let daemon = test_daemon("screenshot_resolve");
        let addr = spawn_server(&daemon);
        daemon.registry.create_pending(
            "dom_screenshot_1234567890123456_1",
            "screenshot",
            serde_json::json!({}),
            Duration::from_secs(30),
        );
        agent()
            .post(&format!("http://{addr}/screenshots"))
            .set(CLIENT_HEADER, "client-c")
            .send_string(
                &serde_json::json!({
                    "data_url": "data:image/png;base64,aGVsbG8=",
                    "correlation_id": "dom_screenshot_1234567890123456_1",
                })
                .to_string(),
            )
            .unwrap();
        let snap = daemon.registry.snapshot("dom_screenshot_1234567890123456_1").unwrap();
        assert_eq!(snap.status, crate::QueryStatus::Complete);
        assert!(snap.result.unwrap()["screenshot_path"].is_string());
    }

    #[test]
    fn test_ws_events_batch_too_large() {
        let daemon = test_daemon("ws_413");
        let addr = spawn_server(&daemon);
        let huge = "x".repeat(daemon.config.max_body_bytes + 10);
        let err = agent()
            .post(&format!("http://{addr}/websocket-events"))
            .send_string(&huge)
            .unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 413),
            other => panic!("expected 413, got {other}"),
        }
    }

    #[test]
    fn test_ws_circuit_opens_under_flood() {
        let daemon = {
            let state_dir = std::env::temp_dir()
                .join("gasoline_test")
                .join(format!("server_circuit_{}", std::process::id()));
            let mut config = DaemonConfig::resolve(Some(0), Some(state_dir), None, None, None);
            config.ws_circuit_threshold = 3;
            config.ws_circuit_cooldown = Duration::from_secs(5);
            Arc::new(Daemon::new(config))
        };
        let addr = spawn_server(&daemon);
        let body = serde_json::json!({ "events": [] }).to_string();
        let mut saw_circuit = false;
        for _ in 0..6 {
            match agent().post(&format!("http://{addr}/websocket-events")).send_string(&body) {
                Ok(_) => {}
                Err(ureq::Error::Status(429, _)) => saw_circuit = true,
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(saw_circuit, "flood should open the circuit");
    }

    #[test]
    fn test_shutdown_requires_client_header() {
        let daemon = test_daemon("shutdown");
        let addr = spawn_server(&daemon);
        let err = agent().post(&format!("http://{addr}/shutdown")).send_string("").unwrap_err();
        match err {
            ureq::Error::Status(code, _) => assert_eq!(code, 403),
            other => panic!("expected 403, got {other}"),
        }
        let resp = agent()
            .post(&format!("http://{addr}/shutdown"))
            .set(CLIENT_HEADER, "cli")
            .send_string("")
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(daemon.shutdown_requested());
    }

    #[test]
    fn test_mcp_endpoint_speaks_jsonrpc() {
        let daemon = test_daemon("mcp");
        let addr = spawn_server(&daemon);
        let resp = agent()
            .post(&format!("http://{addr}/mcp"))
            .send_string(
                &serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }).to_string(),
            )
            .unwrap();
        let body: Value = resp.into_json().unwrap();
        assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_mcp_shared_secret_enforced() {
        let daemon = {
            let state_dir = std::env::temp_dir()
                .join("gasoline_test")
                .join(format!("server_secret_{}", std::process::id()));
            let config = DaemonConfig::resolve(
                Some(0),
                Some(state_dir),
                None,
                Some("hunter2".to_string()),
                None,
            );
            Arc::new(Daemon::new(config))
        };
        let addr = spawn_server(&daemon);
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string();
        match agent().post(&format!("http://{addr}/mcp")).send_string(&frame).unwrap_err() {
            ureq::Error::Status(code, _) => assert_eq!(code, 401),
            other => panic!("expected 401, got {other}"),
        }
        let resp = agent()
            .post(&format!("http://{addr}/mcp"))
            .set(KEY_HEADER, "hunter2")
            .send_string(&frame)
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[test]
    fn test_diagnostics_reports_recent_traffic() {
        let daemon = test_daemon("diag");
        let addr = spawn_server(&daemon);
        agent().get(&format!("http://{addr}/health")).call().unwrap();
        let resp = agent().get(&format!("http://{addr}/diagnostics")).call().unwrap();
        let body: Value = resp.into_json().unwrap();
        let entries = body["entries"].as_array().unwrap();
        assert!(entries.iter().any(|e| e.as_str().unwrap().contains("GET /health status=200")));
    }
}
