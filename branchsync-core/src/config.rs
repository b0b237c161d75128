//! YAML configuration file.
//!
//! ```yaml
//! source: fs
//! store:
//!   connect: /var/lib/branchsync/store
//!   watch_root: /dms/git-repo-status
//! workers: 2
//! deploy_prefix: deploy-
//! targets:
//!   - name: app
//!     git_uri: ssh://git@example.com/org/app.git
//!     resource_directory: /data
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::DEFAULT_DEPLOY_PREFIX;

/// Store namespace under which one node per repository is watched.
pub const DEFAULT_WATCH_ROOT: &str = "/dms/git-repo-status";

/// Worker pool size; sync work is network and disk bound.
pub const DEFAULT_WORKERS: usize = 2;

/// Selects whether the notification-driven path is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Directory-backed notification store.
    Fs,
    /// No notification store; startup syncs and force triggers only.
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string of the notification store. For `fs` this is the
    /// directory that backs the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    #[serde(default = "default_watch_root")]
    pub watch_root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connect: None,
            watch_root: default_watch_root(),
        }
    }
}

/// One configured target, as written in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub git_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_port: Option<u16>,
    pub resource_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_plain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_host_keys: Vec<String>,
}

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceMode,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_deploy_prefix")]
    pub deploy_prefix: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_watch_root() -> String {
    DEFAULT_WATCH_ROOT.to_owned()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_deploy_prefix() -> String {
    DEFAULT_DEPLOY_PREFIX.to_owned()
}

impl Config {
    /// Load and validate the configuration at `path`.
    ///
    /// Returns `ConfigError::Parse` (with path + line context) for malformed
    /// YAML and `ConfigError::Invalid` for semantic problems.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.deploy_prefix.is_empty() {
            return Err(ConfigError::Invalid("deploy_prefix must not be empty".into()));
        }
        if self.source == SourceMode::Fs && self.store.connect.is_none() {
            return Err(ConfigError::Invalid(
                "source 'fs' requires store.connect".into(),
            ));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid("target with empty name".into()));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
        }
        Ok(())
    }
}
