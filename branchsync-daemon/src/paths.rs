use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// Repeated identical writes to one store file inside this window are
/// delivered once.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Capacity of each watcher's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub fn branchsync_root(home: &Path) -> PathBuf {
    home.join(".branchsync")
}

pub fn socket_path(home: &Path) -> PathBuf {
    branchsync_root(home).join(DAEMON_SOCKET)
}

/// Store path watched for one repository.
pub fn repo_watch_path(watch_root: &str, repo_name: &str) -> String {
    format!("{}/{repo_name}", watch_root.trim_end_matches('/'))
}
