//! `branchsync daemon`: run the sync daemon or talk to a running one.

use anyhow::{Context, Result};
use clap::Subcommand;

use branchsync_core::Config;
use branchsync_daemon::paths::socket_path;
use branchsync_daemon::{request_status, request_stop, start_blocking, DaemonError};

use crate::GlobalArgs;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run daemon in foreground (watchers + socket server).
    Start {
        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Request graceful daemon shutdown over Unix socket.
    Stop,
    /// Query daemon runtime status over Unix socket.
    Status,
}

pub fn run(command: DaemonCommand, args: &GlobalArgs) -> Result<()> {
    let home = &args.home;

    match command {
        DaemonCommand::Start { log_json } => {
            let config = Config::load(&args.config)
                .with_context(|| format!("failed to load {}", args.config.display()))?;
            start_blocking(config, home, log_json).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(home) {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(home).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}
