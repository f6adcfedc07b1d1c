// Module declarations
mod bridge;
mod buffers;
mod cli;
mod config;
mod diagnostics;
mod dispatch;
mod lifecycle;
mod mcp;
mod perf;
mod registry;
mod retry;
mod security;
mod server;
mod tool_args;
mod tool_defs;
mod tools;
mod types;
mod util;

// Re-export module items at the crate root so cross-module references stay
// short; modules address each other through this shared namespace.
#[allow(unused_imports)]
pub(crate) use bridge::*;
#[allow(unused_imports)]
pub(crate) use buffers::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use diagnostics::*;
#[allow(unused_imports)]
pub(crate) use dispatch::*;
#[allow(unused_imports)]
pub(crate) use lifecycle::*;
#[allow(unused_imports)]
pub(crate) use mcp::*;
#[allow(unused_imports)]
pub(crate) use perf::*;
#[allow(unused_imports)]
pub(crate) use registry::*;
#[allow(unused_imports)]
pub(crate) use retry::*;
#[allow(unused_imports)]
pub(crate) use security::*;
#[allow(unused_imports)]
pub(crate) use server::*;
#[allow(unused_imports)]
pub(crate) use tool_args::*;
#[allow(unused_imports)]
pub(crate) use tool_defs::*;
#[allow(unused_imports)]
pub(crate) use tools::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::panic::AssertUnwindSafe;

use clap::Parser;

fn main() {
    let cli = Cli::parse();
    let config = DaemonConfig::resolve(
        cli.port,
        cli.state_dir.clone(),
        cli.log_file.clone(),
        cli.api_key.clone(),
        cli.max_entries,
    );
    let state_dir = config.state_dir.clone();

    // The single catch_unwind at process entry: a panic anywhere becomes a
    // crash fingerprint in the state dir and exit code 1.
    match std::panic::catch_unwind(AssertUnwindSafe(|| run(cli, config))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            eprintln!("[gasoline] {err}");
            std::process::exit(1);
        }
        Err(panic) => {
            let detail = panic_detail(panic.as_ref());
            write_crash_log(&state_dir, &detail);
            eprintln!("[gasoline] panic: {detail}");
            std::process::exit(1);
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run(cli: Cli, config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    if cli.persist {
        eprintln!("[gasoline] --persist is deprecated and ignored");
    }

    if cli.stop || cli.force {
        let report = stop_daemon(&config.state_dir, config.port, cli.force)?;
        println!("{report}");
        return Ok(());
    }
    if cli.check {
        return run_check(&config);
    }
    if cli.doctor {
        return run_doctor(&config);
    }
    if cli.connect {
        return run_connect(&config, cli.client_id.as_deref());
    }
    if cli.daemon {
        return run_daemon(config);
    }
    // MCP hosts launch the bare binary; the bridge is the default mode.
    run_bridge(config)
}
