//! Hierarchical notification store.
//!
//! Nodes are addressed by absolute `/`-separated paths. A leaf node carries
//! the JSON change markers of one branch. Subscribers receive [`StoreEvent`]s
//! on their own bounded channel; delivery never blocks the store.

pub mod fs;
pub mod memory;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::StoreError;

pub use fs::FsStore;
pub use memory::MemoryStore;

pub type SubscriptionId = u64;

/// A subscriber's delivery channel. Subscribing twice with the same id to the
/// same path is a no-op.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tx: mpsc::Sender<StoreEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The child set of `path` changed; `children` are names, not paths.
    ChildrenChanged { path: String, children: Vec<String> },
    DataChanged { path: String, data: Vec<u8> },
    DataDeleted { path: String },
}

/// Store operations used by the watchers. All calls may block.
pub trait NotificationStore: Send + Sync + 'static {
    /// Create `path` and every missing ancestor. Idempotent.
    fn ensure_path(&self, path: &str) -> Result<(), StoreError>;

    /// Sorted child names of `path`.
    fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Data stored at `path`; `None` for a node without data.
    fn read_data(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn subscribe_child_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError>;

    fn subscribe_data_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError>;
}

/// `<parent>/<child>` for store paths.
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{}/{child}", parent.trim_end_matches('/'))
    }
}

/// Parent of a store path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", "")) | None => None,
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
    }
}

impl StoreEvent {
    pub fn path(&self) -> &str {
        match self {
            StoreEvent::ChildrenChanged { path, .. }
            | StoreEvent::DataChanged { path, .. }
            | StoreEvent::DataDeleted { path } => path,
        }
    }
}

/// Hand `event` to `sub` without waiting. A full or closed channel drops the
/// event with a log line. A dropped event is a missed sync for its path.
pub(crate) fn deliver(sub: &Subscription, event: StoreEvent) {
    match sub.tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::error!(
                subscription = sub.id,
                path = event.path(),
                ?event,
                "subscriber channel full; event dropped"
            );
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(subscription = sub.id, "subscriber channel closed");
        }
    }
}
