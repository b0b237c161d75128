//! `branchsync check-config`: validate the configuration file.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use branchsync_core::{Config, SourceMode, Target};
use branchsync_daemon::paths::repo_watch_path;

use crate::GlobalArgs;

#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Print the resolved targets as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ResolvedTarget {
    name: String,
    repo_name: String,
    remote: String,
    repo_dir: String,
    watch_path: Option<String>,
    ssh_key: bool,
}

#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "target")]
    name: String,
    #[tabled(rename = "remote")]
    remote: String,
    #[tabled(rename = "directory")]
    repo_dir: String,
    #[tabled(rename = "watch path")]
    watch_path: String,
}

impl CheckConfigArgs {
    pub fn run(self, args: &GlobalArgs) -> Result<()> {
        let config = Config::load(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?;

        let mut resolved = Vec::new();
        let mut failures = 0usize;
        for target_config in &config.targets {
            match Target::from_config(target_config, &config.deploy_prefix) {
                Ok(target) => resolved.push(resolve(&config, &target)),
                Err(err) => {
                    failures += 1;
                    eprintln!("{} '{}': {err}", "✗".red().bold(), target_config.name);
                }
            }
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&resolved).context("failed to render targets JSON")?
            );
        } else if !resolved.is_empty() {
            let rows: Vec<TargetRow> = resolved
                .iter()
                .map(|t| TargetRow {
                    name: t.name.clone(),
                    remote: t.remote.clone(),
                    repo_dir: t.repo_dir.clone(),
                    watch_path: t.watch_path.clone().unwrap_or_else(|| "-".to_string()),
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }

        if failures > 0 {
            bail!("{failures} target(s) would be skipped");
        }
        if !self.json {
            println!("{} {} target(s) ok", "✓".green().bold(), resolved.len());
        }
        Ok(())
    }
}

fn resolve(config: &Config, target: &Target) -> ResolvedTarget {
    let watch_path = match config.source {
        SourceMode::Fs => Some(repo_watch_path(&config.store.watch_root, &target.repo_name)),
        SourceMode::None => None,
    };
    ResolvedTarget {
        name: target.name.to_string(),
        repo_name: target.repo_name.clone(),
        remote: target.remote_url(),
        repo_dir: target.layout.root().display().to_string(),
        watch_path,
        ssh_key: target.ssh.is_some(),
    }
}
