//! Per-target repository sync state machine.
//!
//! ## `sync_master`
//!
//! 1. Open `<root>/master`; if that fails, clone the remote's `master` there.
//! 2. Otherwise fetch, then pull. A pull conflict on master is logged only.
//! 3. List remote-tracking branches and return the deployment branches.
//!
//! ## `sync_branch`
//!
//! 1. Resolve `<root>/<suffix>`; fork it from master if missing.
//! 2. Check out the branch (create + track `origin/<branch>` if needed).
//! 3. Pull `origin/<branch>`, at most [`PULL_ATTEMPTS`] times; a conflict
//!    triggers a hard reset to `origin/<branch>` before the next attempt.
//! 4. Notify change handlers, also when the conflict outlived every
//!    attempt (the checkout then sits at `origin/<branch>` after the reset).
//!
//! Every step runs inside a scheduler unit keyed by the target name, so at
//! most one of them touches a target's directories at a time.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use branchsync_core::types::{last_segment, MASTER_BRANCH, REMOTE_NAME};
use branchsync_core::{Target, TargetName};

use crate::error::SyncError;
use crate::fsutil::copy_tree;
use crate::handlers::HandlerRegistry;
use crate::scheduler::KeyedScheduler;
use crate::vcs::{CheckoutRequest, ListMode, TransportConfig, Vcs, VcsError};

/// Pull attempts per branch sync; the second one follows a hard reset.
pub const PULL_ATTEMPTS: usize = 2;

/// Result of a branch sync that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSyncOutcome {
    /// A pull succeeded.
    Synced { resets: usize },
    /// Every pull attempt hit a conflict; the checkout was left at the
    /// remote head by the final reset.
    Abandoned { resets: usize },
}

pub struct RepositorySyncEngine<V: Vcs> {
    target: Arc<Target>,
    transport: TransportConfig,
    vcs: Arc<V>,
    scheduler: KeyedScheduler<TargetName>,
    handlers: HandlerRegistry,
}

impl<V: Vcs> RepositorySyncEngine<V> {
    pub fn new(
        target: Arc<Target>,
        vcs: Arc<V>,
        scheduler: KeyedScheduler<TargetName>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            transport: TransportConfig::for_target(&target),
            target,
            vcs,
            scheduler,
            handlers,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Ordering key shared by every unit touching this target.
    fn key(&self) -> TargetName {
        self.target.name.clone()
    }

    /// Schedule a master sync followed by a sync of every discovered
    /// deployment branch.
    pub fn schedule_master(self: &Arc<Self>) -> Result<(), SyncError> {
        let engine = Arc::clone(self);
        self.scheduler.submit(Some(self.key()), move || {
            let branches = match engine.sync_master() {
                Ok(branches) => branches,
                Err(err) => {
                    error!(target = %engine.target.name, error = %err, "master sync failed");
                    return;
                }
            };
            for branch in branches {
                if let Err(err) = engine.schedule_branch(&branch) {
                    warn!(
                        target = %engine.target.name,
                        %branch,
                        error = %err,
                        "could not schedule branch sync",
                    );
                }
            }
        })?;
        Ok(())
    }

    /// Schedule a sync of one deployment branch. A branch outside the
    /// deployment convention is rejected here, before anything is queued.
    pub fn schedule_branch(self: &Arc<Self>, branch: &str) -> Result<(), SyncError> {
        self.target.layout.branch_dir(branch)?;
        let engine = Arc::clone(self);
        let branch = branch.to_owned();
        self.scheduler.submit(Some(self.key()), move || {
            match engine.sync_branch(&branch) {
                Ok(outcome) => {
                    debug!(target = %engine.target.name, %branch, ?outcome, "branch sync finished")
                }
                Err(err) => {
                    error!(target = %engine.target.name, %branch, error = %err, "branch sync failed")
                }
            }
        })?;
        Ok(())
    }

    /// Clone or update the master checkout and return the deployment
    /// branches found on the remote, in ref-name order.
    pub fn sync_master(&self) -> Result<Vec<String>, SyncError> {
        let master_dir = self.target.layout.master_dir();
        let dir = master_dir.display();

        let repo = match self.vcs.open(&master_dir) {
            Ok(mut repo) => {
                info!(target = %self.target.name, %dir, "master branch already downloaded");
                self.vcs.fetch(&mut repo, &self.transport)?;
                info!(target = %self.target.name, %dir, "fetch complete");
                match self.vcs.pull(&mut repo, &self.transport, None) {
                    Ok(()) => info!(target = %self.target.name, %dir, "pull complete"),
                    Err(VcsError::Conflict(reason)) => warn!(
                        target = %self.target.name,
                        %dir,
                        %reason,
                        "master pull conflict; keeping current checkout",
                    ),
                    Err(err) => return Err(err.into()),
                }
                repo
            }
            Err(reason) => {
                info!(target = %self.target.name, %dir, %reason, "starting master download");
                let repo = self
                    .vcs
                    .clone_repo(&self.transport, &master_dir, MASTER_BRANCH)?;
                info!(target = %self.target.name, %dir, "download complete");
                repo
            }
        };

        let refs = self.vcs.list_branches(&repo, ListMode::Remote)?;
        info!(target = %self.target.name, %dir, branches = ?refs, "found branches");
        Ok(refs
            .iter()
            .map(|name| last_segment(name))
            .filter(|branch| self.target.layout.is_deploy_branch(branch))
            .map(str::to_owned)
            .collect())
    }

    /// Bring the checkout of `branch` up to date with `origin/<branch>`.
    pub fn sync_branch(&self, branch: &str) -> Result<BranchSyncOutcome, SyncError> {
        let branch_dir = self.target.layout.branch_dir(branch)?;
        let dir = branch_dir.display();
        info!(target = %self.target.name, %branch, %dir, "start branch pull");

        if !branch_dir.exists() {
            info!(target = %self.target.name, %branch, %dir, "copy from master");
            copy_tree(&self.target.layout.master_dir(), &branch_dir)?;
        }

        let mut repo = self.vcs.open(&branch_dir)?;
        let has_branch = self
            .vcs
            .list_branches(&repo, ListMode::Local)?
            .iter()
            .any(|name| last_segment(name).eq_ignore_ascii_case(branch));
        let on_branch = self
            .vcs
            .current_branch(&repo)?
            .is_some_and(|current| current.eq_ignore_ascii_case(branch));

        let upstream = format!("{REMOTE_NAME}/{branch}");
        if !on_branch {
            self.vcs.checkout(
                &mut repo,
                &CheckoutRequest {
                    name: branch.to_owned(),
                    create_if_absent: !has_branch,
                    force_ref_update: true,
                    track_upstream: true,
                    start_point: upstream.clone(),
                },
            )?;
        }

        let mut resets = 0;
        let mut pulled = false;
        for attempt in 1..=PULL_ATTEMPTS {
            match self.vcs.pull(&mut repo, &self.transport, Some(branch)) {
                Ok(()) => {
                    pulled = true;
                    break;
                }
                Err(VcsError::Conflict(reason)) => {
                    warn!(
                        target = %self.target.name,
                        %branch,
                        %dir,
                        attempt,
                        %reason,
                        "checkout conflict; resetting to {upstream}",
                    );
                    self.vcs.reset_hard(&mut repo, &upstream)?;
                    resets += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        drop(repo);

        let outcome = if pulled {
            info!(target = %self.target.name, %branch, %dir, "pull completed");
            BranchSyncOutcome::Synced { resets }
        } else {
            // The last reset already moved the checkout to the remote head.
            warn!(target = %self.target.name, %branch, %dir, resets, "conflict persisted after reset");
            BranchSyncOutcome::Abandoned { resets }
        };
        self.handlers.notify(&self.target.name, branch, &branch_dir);
        Ok(outcome)
    }
}
