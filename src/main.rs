//! fswatchd: a local daemon that watches directory trees and answers
//! queries about which files changed since a logical point in time.
//!
//! Clients connect over a Unix socket and exchange length-delimited
//! structured messages; see the `server` module for the command set.

mod clock;
mod codec;
mod daemon_log;
mod files;
mod paths;
mod protocol;
mod query;
mod root;
mod server;
mod state;
mod trigger;
mod watcher;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Watches directory trees and answers since-queries over a Unix socket.
#[derive(Parser, Debug)]
#[command(name = "fswatchd", version)]
struct Cli {
    /// Path of the Unix socket to listen on.
    #[arg(long)]
    sockname: Option<PathBuf>,

    /// Path of the persisted watch/trigger state file.
    #[arg(long)]
    statefile: Option<PathBuf>,

    /// Path of the file debug log.
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Run attached to the terminal, echoing debug log lines to stderr.
    #[arg(long)]
    foreground: bool,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    let result = runtime.block_on(async_main());

    // Don't wait out lingering blocking work (scans, trigger children).
    runtime.shutdown_timeout(std::time::Duration::from_millis(100));
    result
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    let sockname = match cli.sockname {
        Some(path) => path,
        None => paths::default_sockname()?,
    };
    let state_file = match cli.statefile {
        Some(path) => path,
        None => paths::default_statefile()?,
    };
    if let Some(path) = cli.logfile {
        daemon_log::set_log_path(path);
    }
    daemon_log::set_echo_stderr(cli.foreground);

    let ctx = server::ServerContext::new(sockname, state_file);

    // Re-establish persisted watches before accepting clients; a corrupt
    // state file degrades to an empty watch list.
    if let Err(e) = state::load(&ctx).await {
        eprintln!("[fswatchd] Warning: failed to load saved state: {:#}", e);
    }

    let reaper = server::reaper::spawn(ctx.clone());

    // Ctrl-C takes the same orderly teardown path as shutdown-server.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.initiate_shutdown();
            }
        });
    }

    server::run(ctx).await?;
    let _ = reaper.await;
    Ok(())
}
