//! branchsync daemon: target coordinator, notification stores, store
//! watchers and the control-socket runtime.

pub mod coordinator;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod store;
pub mod watcher;

pub use coordinator::{SyncCoordinator, TargetStatus};
pub use error::{DaemonError, StoreError};
pub use protocol::{
    request_locate, request_status, request_stop, request_trigger, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking};
pub use store::{FsStore, MemoryStore, NotificationStore, StoreEvent, Subscription};
pub use watcher::TargetWatcher;
