//! # branchsync-sync
//!
//! Keyed task ordering and the per-target repository sync state machine.
//!
//! - [`scheduler::KeyedScheduler`] runs units on a bounded pool, one at a
//!   time per key.
//! - [`engine::RepositorySyncEngine`] clones/pulls the master checkout,
//!   discovers deployment branches and keeps one checkout per branch.
//! - [`vcs::Vcs`] is the seam to the version-control primitives;
//!   [`git::Git2Vcs`] implements it with `git2`.

pub mod engine;
pub mod error;
pub mod fsutil;
pub mod git;
pub mod handlers;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vcs;

pub use engine::{BranchSyncOutcome, RepositorySyncEngine, PULL_ATTEMPTS};
pub use error::{SchedulerError, SyncError};
pub use git::Git2Vcs;
pub use handlers::{ChangeHandler, HandlerRegistry};
pub use scheduler::KeyedScheduler;
pub use vcs::{CheckoutRequest, ListMode, TransportConfig, Vcs, VcsError};
