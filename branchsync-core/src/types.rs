//! Domain types shared by the sync engine and the daemon.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Prefix marking a remote branch for per-branch local tracking.
pub const DEFAULT_DEPLOY_PREFIX: &str = "deploy-";

/// Remote branch cloned into the master checkout.
pub const MASTER_BRANCH: &str = "master";

/// Directory name of the master checkout inside a repository root.
pub const MASTER_DIR: &str = "master";

/// Name of the remote every checkout tracks.
pub const REMOTE_NAME: &str = "origin";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a configured sync target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetName(pub String);

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TargetName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for TargetName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Change markers
// ---------------------------------------------------------------------------

/// Payload stored at a branch node of the notification store.
///
/// Both fields are optional; an absent field carries meaning (see
/// [`ChangeMarkers::indicates_change`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMarkers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl ChangeMarkers {
    pub fn new(before: Option<&str>, after: Option<&str>) -> Self {
        Self {
            before: before.map(str::to_owned),
            after: after.map(str::to_owned),
        }
    }

    /// Decode a JSON payload. Non-string marker values are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// A pull is needed iff `before` is present and `after` is absent or
    /// differs from it (ignoring ASCII case).
    pub fn indicates_change(&self) -> bool {
        match (&self.before, &self.after) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(before), Some(after)) => !before.eq_ignore_ascii_case(after),
        }
    }
}

/// A decoded notification for one branch of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub target: TargetName,
    pub branch: String,
    pub markers: ChangeMarkers,
}

impl ChangeEvent {
    /// Decode the payload delivered for `node_path`; the branch is the final
    /// path segment.
    pub fn from_notification(
        target: &TargetName,
        node_path: &str,
        payload: &[u8],
    ) -> Result<Self, serde_json::Error> {
        let markers = ChangeMarkers::decode(payload)?;
        Ok(Self {
            target: target.clone(),
            branch: last_segment(node_path).to_owned(),
            markers,
        })
    }

    pub fn indicates_change(&self) -> bool {
        self.markers.indicates_change()
    }
}

/// Final `/`-separated segment of a store path or ref name.
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Repository layout
// ---------------------------------------------------------------------------

/// On-disk layout of one target:
///
/// ```text
/// <resource_directory>/<repo_name>/
///   master/            master checkout (cloned)
///   <suffix>/          one per deployment branch, prefix stripped
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    root: PathBuf,
    deploy_prefix: String,
}

impl RepoLayout {
    pub fn new(
        resource_directory: impl AsRef<Path>,
        repo_name: &str,
        deploy_prefix: impl Into<String>,
    ) -> Self {
        Self {
            root: resource_directory.as_ref().join(repo_name),
            deploy_prefix: deploy_prefix.into(),
        }
    }

    /// `<resource_directory>/<repo_name>`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<resource_directory>/<repo_name>/master`; pure, no I/O.
    pub fn master_dir(&self) -> PathBuf {
        self.root.join(MASTER_DIR)
    }

    pub fn deploy_prefix(&self) -> &str {
        &self.deploy_prefix
    }

    pub fn is_deploy_branch(&self, branch: &str) -> bool {
        branch.starts_with(&self.deploy_prefix)
    }

    /// Directory for a deployment branch, named by stripping the prefix.
    pub fn branch_dir(&self, branch: &str) -> Result<PathBuf, LayoutError> {
        match branch.strip_prefix(&self.deploy_prefix) {
            Some(suffix) => Ok(self.root.join(suffix)),
            None => Err(LayoutError::NotDeployBranch {
                branch: branch.to_owned(),
                prefix: self.deploy_prefix.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RepoLayout {
        RepoLayout::new("/data", "app", DEFAULT_DEPLOY_PREFIX)
    }

    #[test]
    fn layout_paths() {
        let layout = layout();
        assert_eq!(layout.root(), Path::new("/data/app"));
        assert_eq!(layout.master_dir(), PathBuf::from("/data/app/master"));
        assert_eq!(
            layout.branch_dir("deploy-prod").expect("deploy branch"),
            PathBuf::from("/data/app/prod")
        );
    }

    #[test]
    fn branch_dir_rejects_non_deploy_branch() {
        let err = layout().branch_dir("feature-x").unwrap_err();
        assert_eq!(
            err,
            LayoutError::NotDeployBranch {
                branch: "feature-x".into(),
                prefix: "deploy-".into(),
            }
        );
        assert!(err.to_string().contains("feature-x"));
    }

    #[test]
    fn change_event_takes_branch_from_last_segment() {
        let event = ChangeEvent::from_notification(
            &TargetName::from("app"),
            "/dms/git-repo-status/app/deploy-prod",
            br#"{"before":"c1","after":"c2"}"#,
        )
        .expect("decode");
        assert_eq!(event.branch, "deploy-prod");
        assert!(event.indicates_change());
    }

    #[test]
    fn markers_compare_case_insensitively() {
        assert!(!ChangeMarkers::new(Some("ABC"), Some("abc")).indicates_change());
    }

    #[test]
    fn markers_reject_non_string_values() {
        assert!(ChangeMarkers::decode(br#"{"before":1,"after":"b"}"#).is_err());
        assert!(ChangeMarkers::decode(b"not json").is_err());
    }

    #[test]
    fn target_name_display() {
        assert_eq!(TargetName::from("app").to_string(), "app");
    }
}
