//! Error types for branchsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use branchsync_core::LayoutError;

use crate::vcs::VcsError;

/// Errors from the keyed scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `shutdown` was called; no new units are accepted.
    #[error("scheduler is shut down")]
    ShutDown,

    /// The scheduler was built outside of a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// All errors that can arise from one sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Branch outside the deployment convention; a configuration error.
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    /// A version-control primitive failed.
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
