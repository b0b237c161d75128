//! `branchsync trigger`: force a branch sync on the running daemon.

use anyhow::{bail, Context, Result};
use clap::Args;

use branchsync_daemon::request_trigger;

use crate::GlobalArgs;

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Configured target name.
    pub target: String,

    /// Deployment branch, e.g. `deploy-prod`.
    pub branch: String,
}

impl TriggerArgs {
    pub fn run(self, args: &GlobalArgs) -> Result<()> {
        let reply = request_trigger(&args.home, &self.target, &self.branch)
            .with_context(|| format!("trigger failed for '{}'", self.target))?;
        if reply["scheduled"] != serde_json::Value::Bool(true) {
            bail!("daemon does not know target '{}'", self.target);
        }
        println!("scheduled sync of '{}' on '{}'", self.branch, self.target);
        Ok(())
    }
}
