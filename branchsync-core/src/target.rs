//! A validated, immutable sync target built from a [`TargetConfig`].

use std::fmt;
use std::path::Path;

use crate::config::TargetConfig;
use crate::error::ConfigError;
use crate::types::{RepoLayout, TargetName};

/// SSH private key material loaded at target construction.
#[derive(Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub private_key: String,
    pub passphrase: Option<String>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One remote repository kept in sync on disk.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: TargetName,
    pub git_uri: String,
    pub repo_name: String,
    pub layout: RepoLayout,
    pub ssh_port: Option<u16>,
    pub ssh: Option<SshCredentials>,
    /// Hex SHA-256 fingerprints of accepted SSH host keys. Empty accepts any.
    pub host_keys: Vec<String>,
}

impl Target {
    /// Derive the repository name and load credential material.
    pub fn from_config(config: &TargetConfig, deploy_prefix: &str) -> Result<Self, ConfigError> {
        let repo_name = parse_repo_name(&config.git_uri)?;
        let ssh = load_ssh_credentials(config)?;
        Ok(Self {
            name: TargetName::from(config.name.as_str()),
            git_uri: config.git_uri.clone(),
            layout: RepoLayout::new(&config.resource_directory, &repo_name, deploy_prefix),
            repo_name,
            ssh_port: config.git_port,
            ssh,
            host_keys: config
                .ssh_host_keys
                .iter()
                .map(|k| normalize_fingerprint(k))
                .collect(),
        })
    }

    /// Remote URL with the configured SSH port applied.
    ///
    /// `ssh://` URLs get their port replaced; scp-style `user@host:path`
    /// is rewritten to `ssh://user@host:port/path`. Other schemes are left
    /// untouched.
    pub fn remote_url(&self) -> String {
        match self.ssh_port {
            Some(port) => with_ssh_port(&self.git_uri, port),
            None => self.git_uri.clone(),
        }
    }
}

/// Last path segment of the URI with a trailing extension stripped.
///
/// `https://host/org/app.git` → `app`. A URI without `/` or with an empty
/// last segment is a configuration error.
pub fn parse_repo_name(uri: &str) -> Result<String, ConfigError> {
    let Some((_, segment)) = uri.rsplit_once('/') else {
        return Err(ConfigError::RepoUri { uri: uri.to_owned() });
    };
    let name = match segment.rfind('.') {
        Some(dot) => &segment[..dot],
        None => segment,
    };
    if name.is_empty() {
        return Err(ConfigError::RepoUri { uri: uri.to_owned() });
    }
    Ok(name.to_owned())
}

fn load_ssh_credentials(config: &TargetConfig) -> Result<Option<SshCredentials>, ConfigError> {
    let key = match (&config.ssh_key_plain, &config.ssh_key_file) {
        (Some(plain), _) => plain.clone(),
        (None, Some(path)) => read_key_file(&config.name, path)?,
        (None, None) => return Ok(None),
    };
    if !key.contains("PRIVATE KEY-----") {
        return Err(ConfigError::SshKey {
            target: config.name.clone(),
            reason: "not a PEM/OpenSSH private key".into(),
        });
    }
    Ok(Some(SshCredentials {
        private_key: key,
        passphrase: config.ssh_key_passphrase.clone(),
    }))
}

fn read_key_file(target: &str, path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::SshKey {
        target: target.to_owned(),
        reason: format!("{}: {e}", path.display()),
    })
}

fn normalize_fingerprint(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn with_ssh_port(uri: &str, port: u16) -> String {
    if let Some(rest) = uri.strip_prefix("ssh://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };
        let host = match host_port.rsplit_once(':') {
            Some((host, _)) => host,
            None => host_port,
        };
        let user = user.map(|u| format!("{u}@")).unwrap_or_default();
        return format!("ssh://{user}{host}:{port}{path}");
    }
    if !uri.contains("://") {
        if let Some((authority, path)) = uri.split_once(':') {
            let path = path.trim_start_matches('/');
            return format!("ssh://{authority}:{port}/{path}");
        }
    }
    uri.to_owned()
}
