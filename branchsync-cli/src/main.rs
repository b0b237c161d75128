//! branchsync: keep local checkouts of deployment branches in sync.
//!
//! # Usage
//!
//! ```text
//! branchsync [--config <file>] [--home <dir>] daemon start [--log-json]
//! branchsync daemon stop|status
//! branchsync trigger <target> <branch>
//! branchsync locate <target>
//! branchsync check-config
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    check_config::CheckConfigArgs, daemon::DaemonCommand, locate::LocateArgs,
    trigger::TriggerArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "branchsync",
    version,
    about = "Mirror remote deployment branches into local checkouts",
    long_about = None,
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "branchsync.yaml")]
    config: PathBuf,

    /// Directory holding `.branchsync/` runtime files (default: home directory).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Force a sync of one deployment branch.
    Trigger(TriggerArgs),

    /// Print the local repository directory of a target.
    Locate(LocateArgs),

    /// Validate the configuration file and print the resolved targets.
    CheckConfig(CheckConfigArgs),
}

/// Global options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config: PathBuf,
    pub home: PathBuf,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = match cli.home {
        Some(home) => home,
        None => dirs::home_dir().context("could not determine home directory")?,
    };
    let ctx = GlobalArgs {
        config: cli.config,
        home,
    };
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, &ctx),
        Commands::Trigger(args) => args.run(&ctx),
        Commands::Locate(args) => args.run(&ctx),
        Commands::CheckConfig(args) => args.run(&ctx),
    }
}
