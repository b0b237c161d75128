//! `git2`-backed [`Vcs`].

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, CertificateCheckStatus, Cred, ErrorClass, ErrorCode, FetchOptions,
    RemoteCallbacks, Repository, ResetType,
};

use branchsync_core::types::REMOTE_NAME;

use crate::vcs::{CheckoutRequest, ListMode, TransportConfig, Vcs, VcsError};

/// Give up after this many credential callbacks in one operation; libgit2
/// keeps asking while authentication fails.
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Production [`Vcs`] backed by libgit2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Git2Vcs;

impl From<git2::Error> for VcsError {
    fn from(err: git2::Error) -> Self {
        let message = err.message().to_owned();
        match err.code() {
            ErrorCode::Conflict | ErrorCode::MergeConflict | ErrorCode::Uncommitted => {
                VcsError::Conflict(message)
            }
            ErrorCode::NotFound | ErrorCode::UnbornBranch => VcsError::NotFound(message),
            ErrorCode::Auth | ErrorCode::Certificate => VcsError::Transport(message),
            _ => match err.class() {
                ErrorClass::Net
                | ErrorClass::Ssh
                | ErrorClass::Http
                | ErrorClass::Ssl
                | ErrorClass::Callback => VcsError::Transport(message),
                _ => VcsError::Other(message),
            },
        }
    }
}

fn remote_callbacks(transport: &TransportConfig) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0usize;
    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.is_ssh_key() {
            let user = username_from_url.unwrap_or("git");
            if let Some(ssh) = &transport.ssh {
                return Cred::ssh_key_from_memory(
                    user,
                    None,
                    &ssh.private_key,
                    ssh.passphrase.as_deref(),
                );
            }
            return Cred::ssh_key_from_agent(user);
        }
        Cred::default()
    });
    callbacks.certificate_check(move |cert, host| {
        let Some(hostkey) = cert.as_hostkey() else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        if transport.host_keys.is_empty() {
            return Ok(CertificateCheckStatus::CertificateOk);
        }
        let fingerprint = hostkey.hash_sha256().map(hex::encode);
        match fingerprint {
            Some(fp) if transport.host_keys.iter().any(|k| *k == fp) => {
                Ok(CertificateCheckStatus::CertificateOk)
            }
            _ => {
                tracing::warn!(%host, "ssh host key not in allowlist");
                Err(git2::Error::from_str(&format!(
                    "host key for {host} is not in the allowlist"
                )))
            }
        }
    });
    callbacks
}

fn fetch_options(transport: &TransportConfig) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(transport));
    options
}

fn current_branch_of(repo: &Repository) -> Result<Option<String>, VcsError> {
    let head = match repo.head() {
        Ok(head) => head,
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            return Ok(None)
        }
        Err(err) => return Err(err.into()),
    };
    if !head.is_branch() {
        return Ok(None);
    }
    Ok(head.shorthand().map(str::to_owned))
}

impl Vcs for Git2Vcs {
    type Repo = Repository;

    fn open(&self, path: &Path) -> Result<Repository, VcsError> {
        Repository::open(path).map_err(VcsError::from)
    }

    fn clone_repo(
        &self,
        transport: &TransportConfig,
        dest: &Path,
        branch: &str,
    ) -> Result<Repository, VcsError> {
        let repo = RepoBuilder::new()
            .branch(branch)
            .fetch_options(fetch_options(transport))
            .clone(&transport.url, dest)?;
        Ok(repo)
    }

    fn fetch(&self, repo: &mut Repository, transport: &TransportConfig) -> Result<(), VcsError> {
        let mut remote = repo.find_remote(REMOTE_NAME)?;
        let mut options = fetch_options(transport);
        remote.fetch(&[] as &[&str], Some(&mut options), None)?;
        Ok(())
    }

    fn pull(
        &self,
        repo: &mut Repository,
        transport: &TransportConfig,
        remote_branch: Option<&str>,
    ) -> Result<(), VcsError> {
        let branch = match remote_branch {
            Some(branch) => branch.to_owned(),
            None => current_branch_of(repo)?
                .ok_or_else(|| VcsError::NotFound("HEAD is not on a branch".into()))?,
        };
        let tracking = format!("refs/remotes/{REMOTE_NAME}/{branch}");

        {
            let mut remote = repo.find_remote(REMOTE_NAME)?;
            let refspec = format!("+refs/heads/{branch}:{tracking}");
            let mut options = fetch_options(transport);
            remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
        }

        let incoming = repo.find_reference(&tracking)?;
        let incoming_commit = incoming.peel_to_commit()?;
        let annotated = repo.reference_to_annotated_commit(&incoming)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(VcsError::Conflict(format!(
                "local branch diverged from {REMOTE_NAME}/{branch}; fast-forward impossible"
            )));
        }

        repo.checkout_tree(
            incoming_commit.as_object(),
            Some(CheckoutBuilder::new().safe()),
        )?;
        let head = repo.head()?;
        let head_name = head
            .name()
            .ok_or_else(|| VcsError::Other("HEAD name is not valid UTF-8".into()))?
            .to_owned();
        repo.find_reference(&head_name)?.set_target(
            incoming_commit.id(),
            &format!("pull: fast-forward to {REMOTE_NAME}/{branch}"),
        )?;
        Ok(())
    }

    fn list_branches(&self, repo: &Repository, mode: ListMode) -> Result<Vec<String>, VcsError> {
        let kind = match mode {
            ListMode::Local => BranchType::Local,
            ListMode::Remote => BranchType::Remote,
        };
        let mut names = Vec::new();
        for entry in repo.branches(Some(kind))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.get().name() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn current_branch(&self, repo: &Repository) -> Result<Option<String>, VcsError> {
        current_branch_of(repo)
    }

    fn checkout(&self, repo: &mut Repository, request: &CheckoutRequest) -> Result<(), VcsError> {
        let existing = match repo.find_branch(&request.name, BranchType::Local) {
            Ok(branch) => Some(branch),
            Err(err) if err.code() == ErrorCode::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let mut branch = match existing {
            Some(branch) => branch,
            None if request.create_if_absent => {
                let start = repo.revparse_single(&request.start_point)?.peel_to_commit()?;
                repo.branch(&request.name, &start, request.force_ref_update)?
            }
            None => {
                return Err(VcsError::NotFound(format!(
                    "local branch '{}' does not exist",
                    request.name
                )))
            }
        };

        if request.track_upstream {
            branch.set_upstream(Some(request.start_point.as_str()))?;
        }

        let reference = branch.into_reference();
        let ref_name = reference
            .name()
            .ok_or_else(|| VcsError::Other("branch ref name is not valid UTF-8".into()))?
            .to_owned();
        let target = reference.peel_to_commit()?;

        repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
        repo.set_head(&ref_name)?;
        Ok(())
    }

    fn reset_hard(&self, repo: &mut Repository, reference: &str) -> Result<(), VcsError> {
        let target = repo.revparse_single(reference)?;
        repo.reset(&target, ResetType::Hard, None)?;
        Ok(())
    }
}
