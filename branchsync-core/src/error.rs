//! Error types for branchsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are fatal where they occur: a bad config file aborts startup, a bad
/// target excludes that target.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Structurally valid YAML with semantically invalid content.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// No repository name could be derived from the URI's last path segment.
    #[error("wrong git uri: {uri}")]
    RepoUri { uri: String },

    /// SSH key material for a target is missing, unreadable or not a private key.
    #[error("ssh key for target '{target}': {reason}")]
    SshKey { target: String, reason: String },
}

/// Errors from resolving branch directories.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// Branch-directory resolution was asked for a branch outside the
    /// deployment-branch convention.
    #[error("branch name '{branch}' does not start with '{prefix}'")]
    NotDeployBranch { branch: String, prefix: String },
}
