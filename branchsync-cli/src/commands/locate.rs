//! `branchsync locate`: print where a target's checkouts live.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use branchsync_core::{Config, Target};
use branchsync_daemon::{request_locate, DaemonError};

use crate::GlobalArgs;

#[derive(Args, Debug)]
pub struct LocateArgs {
    /// Configured target name.
    pub target: String,
}

impl LocateArgs {
    pub fn run(self, args: &GlobalArgs) -> Result<()> {
        let dir = match request_locate(&args.home, &self.target) {
            Ok(reply) => reply["repo_dir"].as_str().map(PathBuf::from),
            // Without a daemon the directory is still derivable from the file.
            Err(DaemonError::DaemonNotRunning { .. }) => locate_from_config(args, &self.target)?,
            Err(err) => return Err(err).context("failed to query daemon"),
        };
        let dir = dir.with_context(|| format!("unknown target '{}'", self.target))?;
        println!("{}", dir.display());
        Ok(())
    }
}

fn locate_from_config(args: &GlobalArgs, name: &str) -> Result<Option<PathBuf>> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let Some(target_config) = config.targets.iter().find(|t| t.name == name) else {
        return Ok(None);
    };
    let target = Target::from_config(target_config, &config.deploy_prefix)
        .with_context(|| format!("invalid target '{name}'"))?;
    Ok(Some(target.layout.root().to_path_buf()))
}
