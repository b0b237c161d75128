//! Version-control seam used by the sync engine.
//!
//! The engine only ever talks to a [`Vcs`]; [`crate::git::Git2Vcs`] is the
//! production implementation and `testing::FakeVcs` a scripted one.
//! Repository handles are released by dropping them.

use std::path::Path;

use thiserror::Error;

use branchsync_core::{SshCredentials, Target};

/// Classified failure of a version-control primitive.
///
/// The engine's retry loop branches on the variant: only `Conflict` is
/// recovered in-process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VcsError {
    /// Local changes collide with incoming changes.
    #[error("checkout conflict: {0}")]
    Conflict(String),

    /// Not a checkout, or a ref/branch that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network, authentication or host-key failure.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

/// Which branches to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Local,
    Remote,
}

/// Arguments of a branch checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub name: String,
    pub create_if_absent: bool,
    pub force_ref_update: bool,
    /// Track `start_point` as the branch's upstream.
    pub track_upstream: bool,
    /// Remote-tracking ref to start a new branch at, e.g. `origin/deploy-prod`.
    pub start_point: String,
}

/// Everything a transport-level call needs to reach the remote.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub url: String,
    pub ssh: Option<SshCredentials>,
    /// Lowercase hex SHA-256 fingerprints; empty accepts any host key.
    pub host_keys: Vec<String>,
}

impl TransportConfig {
    pub fn for_target(target: &Target) -> Self {
        Self {
            url: target.remote_url(),
            ssh: target.ssh.clone(),
            host_keys: target.host_keys.clone(),
        }
    }
}

/// Version-control primitives the sync engine is built on.
pub trait Vcs: Send + Sync + 'static {
    /// An open checkout. Dropping it closes the repository.
    type Repo: Send;

    /// Open an existing checkout; `VcsError::NotFound` if `path` is not one.
    fn open(&self, path: &Path) -> Result<Self::Repo, VcsError>;

    /// Clone `transport.url` into `dest`, checking out `branch`.
    fn clone_repo(
        &self,
        transport: &TransportConfig,
        dest: &Path,
        branch: &str,
    ) -> Result<Self::Repo, VcsError>;

    /// Fetch all configured refspecs from `origin`.
    fn fetch(&self, repo: &mut Self::Repo, transport: &TransportConfig) -> Result<(), VcsError>;

    /// Fetch and fast-forward the current branch from `remote_branch`
    /// (default: the current branch's name on `origin`).
    fn pull(
        &self,
        repo: &mut Self::Repo,
        transport: &TransportConfig,
        remote_branch: Option<&str>,
    ) -> Result<(), VcsError>;

    /// Full ref names, e.g. `refs/remotes/origin/deploy-prod`.
    fn list_branches(&self, repo: &Self::Repo, mode: ListMode) -> Result<Vec<String>, VcsError>;

    /// Short name of the checked-out branch; `None` when detached or unborn.
    fn current_branch(&self, repo: &Self::Repo) -> Result<Option<String>, VcsError>;

    fn checkout(&self, repo: &mut Self::Repo, request: &CheckoutRequest) -> Result<(), VcsError>;

    /// Reset index and working tree to `reference`.
    fn reset_hard(&self, repo: &mut Self::Repo, reference: &str) -> Result<(), VcsError>;
}
