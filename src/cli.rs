use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "gasoline")]
#[command(
    about = "Local observability and automation bridge between a browser extension and MCP hosts",
    long_about = None
)]
#[command(version)]
pub(crate) struct Cli {
    /// Daemon HTTP port (loopback only).
    #[arg(long)]
    pub(crate) port: Option<u16>,

    /// Lifecycle log path (default: <state-dir>/logs/gasoline.jsonl).
    #[arg(long)]
    pub(crate) log_file: Option<PathBuf>,

    /// Runtime state directory (default: OS application-state dir, or $GASOLINE_STATE_DIR).
    #[arg(long)]
    pub(crate) state_dir: Option<PathBuf>,

    /// Ring capacity for console logs and user actions.
    #[arg(long)]
    pub(crate) max_entries: Option<usize>,

    /// Stop the daemon that owns this port's PID file.
    #[arg(long)]
    pub(crate) stop: bool,

    /// With --stop: SIGTERM every matching PID, then SIGKILL after 2 s.
    #[arg(long)]
    pub(crate) force: bool,

    /// Shared secret required on /mcp (or set GASOLINE_API_KEY).
    #[arg(long)]
    pub(crate) api_key: Option<String>,

    /// Probe a running daemon and print its health payload.
    #[arg(long)]
    pub(crate) connect: bool,

    /// Client ID reported with --connect probes.
    #[arg(long)]
    pub(crate) client_id: Option<String>,

    /// One-line liveness check; exits non-zero when the daemon is down.
    #[arg(long)]
    pub(crate) check: bool,

    /// Local diagnosis: state dir, PID files, daemon health.
    #[arg(long)]
    pub(crate) doctor: bool,

    /// Run the stdio<->HTTP bridge for MCP hosts (the default mode).
    #[arg(long)]
    pub(crate) bridge: bool,

    /// Run the HTTP daemon in the foreground.
    #[arg(long)]
    pub(crate) daemon: bool,

    /// Accepted for backward compatibility; ignored.
    #[arg(long, hide = true)]
    pub(crate) persist: bool,
}
