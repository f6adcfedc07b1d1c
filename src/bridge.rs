use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    lifecycle_log_path, parse_rpc_frame, read_rpc_frame, rpc_error, write_rpc_frame, DaemonConfig,
    LifecycleLog, INTERNAL_ERROR, KEY_HEADER,
};

const DAEMON_STARTUP_WAIT: Duration = Duration::from_secs(3);
const DAEMON_STARTUP_POLL: Duration = Duration::from_millis(100);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

// ── stderr isolation ────────────────────────────────────────────────────
//
// While the bridge owns stdout for JSON-RPC frames, anything a dependency
// writes to stderr must land in the lifecycle log instead of the parent's
// pipe. Redirection happens before the first frame is read.

#[cfg(unix)]
pub(crate) fn redirect_stderr_to(path: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    if unsafe { libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // The duplicated descriptor keeps the log open for the process lifetime.
    std::mem::forget(file);
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn redirect_stderr_to(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// EINVAL and EBADF from syncing pipes/ptys are expected; anything else is
/// worth a side-channel note.
pub(crate) fn is_ignorable_sync_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::EBADF))
}

// ── Launch fingerprint ──────────────────────────────────────────────────

/// Recorded in the lifecycle log at bridge start: enough to tell exactly
/// which binary served a session when debugging stale installs.
pub(crate) fn launch_fingerprint() -> Value {
    let exe = std::env::current_exe().ok();
    let sha256 = exe
        .as_deref()
        .and_then(|path| std::fs::read(path).ok())
        .map(|bytes| {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        })
        .unwrap_or_else(|| "unknown".to_string());
    serde_json::json!({
        "exe": exe.map(|p| p.display().to_string()).unwrap_or_else(|| "unknown".to_string()),
        "version": env!("CARGO_PKG_VERSION"),
        "sha256": sha256,
    })
}

// ── Daemon autostart ────────────────────────────────────────────────────

fn health_ok(agent: &ureq::Agent, base_url: &str) -> bool {
    matches!(agent.get(&format!("{base_url}/health")).call(), Ok(resp) if resp.status() == 200)
}

/// Spawns the daemon (this same executable, `--daemon`) detached and waits
/// for `/health` to come up. The daemon outlives the bridge.
pub(crate) fn ensure_daemon(agent: &ureq::Agent, config: &DaemonConfig) -> Result<(), String> {
    let base_url = config.base_url();
    if health_ok(agent, &base_url) {
        return Ok(());
    }
    let exe = std::env::current_exe().map_err(|e| format!("current_exe: {e}"))?;
    let mut cmd = Command::new(exe);
    cmd.arg("--daemon")
        .arg("--port")
        .arg(config.port.to_string())
        .arg("--state-dir")
        .arg(&config.state_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(key) = &config.api_key {
        cmd.env("GASOLINE_API_KEY", key);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn().map_err(|e| format!("daemon spawn: {e}"))?;

    let deadline = std::time::Instant::now() + DAEMON_STARTUP_WAIT;
    while std::time::Instant::now() < deadline {
        if health_ok(agent, &base_url) {
            return Ok(());
        }
        std::thread::sleep(DAEMON_STARTUP_POLL);
    }
    Err(format!("daemon did not report healthy on {base_url} within 3s"))
}

// ── Frame loop ──────────────────────────────────────────────────────────

/// One pass over stdin: read frame, forward, write exactly one response
/// per request, in order. Transport noise goes to `side`, never to the
/// writer. Generic over I/O so tests drive it with in-memory streams.
pub(crate) fn bridge_frame_loop<R, W, F, S>(
    reader: &mut R,
    writer: &mut W,
    mut forward: F,
    mut side: S,
) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(&Value) -> Option<Value>,
    S: FnMut(&str),
{
    while let Some(line) = read_rpc_frame(reader)? {
        let frame = match parse_rpc_frame(&line) {
            Ok(frame) => frame,
            Err(_) => {
                side(&format!("skipped unparseable frame: {}", line.trim()));
                continue;
            }
        };
        let Some(response) = forward(&frame) else {
            continue;
        };
        if let Err(err) = write_rpc_frame(writer, &response) {
            if is_ignorable_sync_error(&err) {
                continue;
            }
            side(&format!("stdout write failed: {err}"));
            return Err(err);
        }
    }
    Ok(())
}

/// POSTs one frame to the daemon's `/mcp`. Requests always produce a
/// response (an internal error envelope if the daemon is unreachable);
/// notifications produce none.
pub(crate) fn forward_frame(
    agent: &ureq::Agent,
    config: &DaemonConfig,
    frame: &Value,
) -> Option<Value> {
    let id = frame.get("id").cloned().unwrap_or(Value::Null);
    let is_request = !id.is_null();
    let mut request = agent.post(&format!("{}/mcp", config.base_url()));
    if let Some(key) = &config.api_key {
        request = request.set(KEY_HEADER, key);
    }
    let outcome = request.send_string(&frame.to_string());
    match outcome {
        Ok(resp) => match resp.into_json::<Value>() {
            // JSON null marks a notification: nothing goes back on stdout.
            Ok(Value::Null) => None,
            Ok(body) => Some(body),
            Err(err) => is_request
                .then(|| rpc_error(id, INTERNAL_ERROR, &format!("daemon response unreadable: {err}"))),
        },
        Err(ureq::Error::Status(code, _)) => {
            is_request.then(|| rpc_error(id, INTERNAL_ERROR, &format!("daemon returned {code}")))
        }
        Err(err) => {
            is_request.then(|| rpc_error(id, INTERNAL_ERROR, &format!("daemon unreachable: {err}")))
        }
    }
}

// ── Bridge entry point ──────────────────────────────────────────────────

pub(crate) fn run_bridge(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = lifecycle_log_path(&config.state_dir, config.log_file.as_deref());
    let isolate = !crate::env_bool("GASOLINE_NO_STDERR_REDIRECT", false);
    if isolate {
        if let Err(err) = redirect_stderr_to(&log_path) {
            // Without isolation we can still run; frames stay clean either way.
            eprintln!("[bridge] stderr redirect failed: {err}");
        }
    }
    if crate::env_bool("GASOLINE_TEST_BRIDGE_NOISE", false) {
        eprintln!("[bridge] GASOLINE_TEST_BRIDGE_NOISE marker");
    }

    let lifecycle = LifecycleLog::start(log_path);
    lifecycle.event(
        "bridge_start",
        serde_json::json!({ "fingerprint": launch_fingerprint(), "port": config.port }),
    );

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(FORWARD_TIMEOUT)
        .timeout_read(FORWARD_TIMEOUT)
        .timeout_write(FORWARD_TIMEOUT)
        .build();

    let stdout = io::stdout();
    if let Err(reason) = ensure_daemon(&agent, &config) {
        lifecycle.event("bridge_startup_failed", serde_json::json!({ "reason": reason }));
        let envelope = rpc_error(
            Value::String("startup".to_string()),
            INTERNAL_ERROR,
            &format!("gasoline daemon failed to start: {reason}"),
        );
        let mut out = stdout.lock();
        let _ = write_rpc_frame(&mut out, &envelope);
        return Err(reason.into());
    }

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();
    let result = bridge_frame_loop(
        &mut reader,
        &mut writer,
        |frame| forward_frame(&agent, &config, frame),
        |note| {
            eprintln!("[bridge] {note}");
            lifecycle.event("bridge_side_channel", serde_json::json!({ "note": note }));
        },
    );
    lifecycle.event("bridge_stop", serde_json::json!({}));
    result.map_err(|e| e.into())
}

// ── Tests ───────────────────────────────────────────────────────────────
