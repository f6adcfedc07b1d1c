use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use serde_json::Value;

use crate::{legacy_state_dir, now_rfc3339, pid_alive, terminate_pid};
use walkdir::WalkDir;

// ── Lifecycle log ───────────────────────────────────────────────────────
//
// Append-only JSONL, written by one background consumer behind a bounded
// channel. Publishers never block: on overflow the event is counted as
// dropped and ingest carries on.

pub(crate) struct LifecycleLog {
    tx: mpsc::SyncSender<Value>,
    dropped: AtomicU64,
    path: PathBuf,
}

impl LifecycleLog {
    pub(crate) fn start(path: PathBuf) -> LifecycleLog {
        let (log, rx) = LifecycleLog::build(path.clone());
        std::thread::spawn(move || {
            for event in rx {
                if let Err(err) = append_jsonl(&path, &event) {
                    eprintln!("[lifecycle] write failed: {err}");
                }
            }
        });
        log
    }

    fn build(path: PathBuf) -> (LifecycleLog, mpsc::Receiver<Value>) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        (LifecycleLog { tx, dropped: AtomicU64::new(0), path }, rx)
    }

    pub(crate) fn event(&self, kind: &str, fields: Value) {
        let mut event = serde_json::json!({
            "ts": now_rfc3339(),
            "event": kind,
        });
        if let (Value::Object(out), Value::Object(extra)) = (&mut event, fields) {
            for (key, value) in extra {
                out.insert(key, value);
            }
        }
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn append_jsonl(path: &Path, event: &Value) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{event}")?;
    Ok(())
}

pub(crate) fn lifecycle_log_path(state_dir: &Path, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(path) => path.to_path_buf(),
        None => state_dir.join("logs").join("gasoline.jsonl"),
    }
}

// ── PID files ───────────────────────────────────────────────────────────

pub(crate) fn pid_file_path(state_dir: &Path, port: u16) -> PathBuf {
    state_dir.join(format!("gasoline-{port}.pid"))
}

pub(crate) fn write_pid_file(state_dir: &Path, port: u16) -> std::io::Result<PathBuf> {
    fs::create_dir_all(state_dir)?;
    let path = pid_file_path(state_dir, port);
    fs::write(&path, format!("{}\n", std::process::id()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}

pub(crate) fn read_pid_file(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub(crate) fn remove_pid_file(state_dir: &Path, port: u16) {
    let _ = fs::remove_file(pid_file_path(state_dir, port));
}

/// Every `gasoline-<port>.pid` directly under the state dir (and the legacy
/// dot-directory, read-only).
pub(crate) fn pid_files(state_dir: &Path) -> Vec<PathBuf> {
    let mut roots = vec![state_dir.to_path_buf()];
    if let Some(legacy) = legacy_state_dir() {
        if legacy != state_dir {
            roots.push(legacy);
        }
    }
    let mut files = Vec::new();
    for root in roots {
        for entry in WalkDir::new(&root).max_depth(1).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name.starts_with("gasoline-") && name.ends_with(".pid") {
                files.push(entry.into_path());
            }
        }
    }
    files
}

/// `--stop`: terminate the daemon owning this port's PID file.
/// `--force`: SIGTERM every PID matching the pattern, wait two seconds,
/// SIGKILL survivors, and clean up the files.
pub(crate) fn stop_daemon(state_dir: &Path, port: u16, force: bool) -> Result<String, String> {
    if force {
        let files = pid_files(state_dir);
        if files.is_empty() {
            return Ok("no daemon PID files found".to_string());
        }
        let mut killed = 0;
        for file in &files {
            if let Some(pid) = read_pid_file(file) {
                terminate_pid(pid);
                killed += 1;
            }
            let _ = fs::remove_file(file);
        }
        return Ok(format!("terminated {killed} daemon process(es)"));
    }

    let path = pid_file_path(state_dir, port);
    let path = if path.exists() {
        path
    } else {
        match legacy_state_dir().map(|legacy| pid_file_path(&legacy, port)) {
            Some(legacy_path) if legacy_path.exists() => legacy_path,
            _ => return Err(format!("no PID file for port {port}")),
        }
    };
    let Some(pid) = read_pid_file(&path) else {
        let _ = fs::remove_file(&path);
        return Err(format!("unreadable PID file {}", path.display()));
    };
    if !pid_alive(pid) {
        let _ = fs::remove_file(&path);
        return Ok(format!("daemon {pid} was already gone; cleaned up PID file"));
    }
    terminate_pid(pid);
    let _ = fs::remove_file(&path);
    Ok(format!("stopped daemon {pid}"))
}

// ── Crash log ───────────────────────────────────────────────────────────

/// Written from the process-entry panic handler; overwrites any prior
/// crash so the newest failure is always the one on disk.
pub(crate) fn write_crash_log(state_dir: &Path, detail: &str) {
    let _ = fs::create_dir_all(state_dir);
    let body = format!(
        "{} gasoline {} panicked\n{detail}\n",
        now_rfc3339(),
        env!("CARGO_PKG_VERSION")
    );
    let _ = fs::write(state_dir.join("crash.log"), body);
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("gasoline_test")
            .join(format!("{}_{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_lifecycle_events_reach_disk() {
        let dir = temp_dir("lifecycle_disk");
        let path = dir.join("gasoline.jsonl");
        let _ = fs::remove_file(&path);
        let log = LifecycleLog::start(path.clone());
        log.event("daemon_start", serde_json::json!({ "port": 7333 }));
        std::thread::sleep(Duration::from_millis(80));
        let contents = fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["event"], "daemon_start");
        assert_eq!(line["port"], 7333);
        assert!(line["ts"].is_string());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_overflow_counts_drops_without_blocking() {
        let dir = temp_dir("lifecycle_drop");
        let path = dir.join("gasoline.jsonl");
        // No worker draining: capacity one, so the second publish drops.
        let (log, _rx) = LifecycleLog::build(path);
        log.event("first", serde_json::json!({}));
        log.event("second", serde_json::json!({}));
        log.event("third", serde_json::json!({}));
        assert_eq!(log.dropped_count(), 2);
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = temp_dir("pidfile");
        let path = write_pid_file(&dir, 7399).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id() as i32));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert!(pid_files(&dir).iter().any(|p| p == &path));
        remove_pid_file(&dir, 7399);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_pattern_match() {
        let dir = temp_dir("pidpattern");
        fs::write(dir.join("gasoline-7333.pid"), "123\n").unwrap();
        fs::write(dir.join("gasoline.jsonl"), "{}\n").unwrap();
        fs::write(dir.join("other-7333.pid"), "456\n").unwrap();
        let files = pid_files(&dir);
        let names: Vec<String> = files
            .iter()
            .filter(|p| p.starts_with(&dir))
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"gasoline-7333.pid".to_string()));
        assert!(!names.contains(&"other-7333.pid".to_string()));
        assert!(!names.contains(&"gasoline.jsonl".to_string()));
    }

    #[test]
    fn test_crash_log_written() {
        let dir = temp_dir("crashlog");
        write_crash_log(&dir, "thread 'main' panicked at src/server.rs:1");
        let body = fs::read_to_string(dir.join("crash.log")).unwrap();
        assert!(body.contains("panicked"));
        assert!(body.contains("src/server.rs:1"));
    }
}
