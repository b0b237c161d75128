//! Directory-backed [`NotificationStore`].
//!
//! The store namespace maps onto a directory tree: `/a/b` is `<root>/a/b`.
//! Interior nodes are directories; a leaf node is a regular file whose bytes
//! are its data. Entries whose name starts with `.` are not nodes.
//!
//! Change delivery uses `notify` with one non-recursive watch per directory
//! that has a subscriber (a data subscription watches the file's parent).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{deliver, NotificationStore, StoreEvent, Subscription};
use crate::error::{store_io_err, StoreError};
use crate::paths::DEBOUNCE_WINDOW;

#[derive(Default)]
struct Watches {
    child_subs: HashMap<PathBuf, Vec<Subscription>>,
    data_subs: HashMap<PathBuf, Vec<Subscription>>,
    watched_dirs: HashSet<PathBuf>,
    /// Last delivered payload per file, for coalescing repeated writes.
    recent: HashMap<PathBuf, (Instant, Vec<u8>)>,
}

pub struct FsStore {
    root: PathBuf,
    watches: Arc<Mutex<Watches>>,
    watcher: Mutex<RecommendedWatcher>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FsStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    pub fn connect(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| store_io_err(root, e))?;
        // Canonicalize so that paths reported by the OS watcher (e.g.
        // /private/var/... on macOS) match the registered directories.
        let root = fs::canonicalize(root).map_err(|e| store_io_err(root, e))?;

        let watches = Arc::new(Mutex::new(Watches::default()));
        let callback_watches = Arc::clone(&watches);
        let callback_root = root.clone();
        let watcher = recommended_watcher(move |event: notify::Result<Event>| {
            handle_event(&callback_root, &callback_watches, event);
        })?;

        tracing::info!(root = %root.display(), "file store connected");
        Ok(Self {
            root,
            watches,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn fs_path(&self, node: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(node.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::NoNode {
                path: node.to_owned(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Register a non-recursive watch on `dir` once. The watches lock is
    /// released before calling into the watcher, whose event thread takes it.
    fn watch_dir(&self, dir: &Path) -> Result<(), StoreError> {
        if !lock(&self.watches).watched_dirs.insert(dir.to_path_buf()) {
            return Ok(());
        }
        if let Err(err) = lock(&self.watcher).watch(dir, RecursiveMode::NonRecursive) {
            lock(&self.watches).watched_dirs.remove(dir);
            return Err(err.into());
        }
        tracing::debug!(path = %dir.display(), "watching store directory");
        Ok(())
    }
}

fn add_subscription(subs: &mut HashMap<PathBuf, Vec<Subscription>>, path: PathBuf, sub: &Subscription) {
    let entry = subs.entry(path).or_default();
    if !entry.iter().any(|s| s.id == sub.id) {
        entry.push(sub.clone());
    }
}

fn list_children(dir: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(name) = name.to_str() {
            if !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn node_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(format!("/{}", segments.join("/")))
}

fn changes_child_set(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

fn handle_event(root: &Path, watches: &Mutex<Watches>, event: notify::Result<Event>) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "store watcher event error");
            return;
        }
    };
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    let mut outgoing = Vec::new();
    {
        let mut watches = lock(watches);
        for path in &event.paths {
            if changes_child_set(&event.kind) {
                if let Some(parent) = path.parent() {
                    if let (Some(subs), Some(node)) =
                        (watches.child_subs.get(parent), node_path(root, parent))
                    {
                        match list_children(parent) {
                            Ok(children) => {
                                for sub in subs {
                                    outgoing.push((
                                        sub.clone(),
                                        StoreEvent::ChildrenChanged {
                                            path: node.clone(),
                                            children: children.clone(),
                                        },
                                    ));
                                }
                            }
                            Err(err) => tracing::warn!(
                                path = %parent.display(),
                                error = %err,
                                "could not list store directory",
                            ),
                        }
                    }
                }
            }

            let Some(subs) = watches.data_subs.get(path).cloned() else {
                continue;
            };
            let Some(node) = node_path(root, path) else {
                continue;
            };
            if path.is_file() {
                let data = match fs::read(path) {
                    Ok(data) => data,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "could not read store file");
                        continue;
                    }
                };
                if !should_deliver(&mut watches.recent, path, &data, Instant::now()) {
                    continue;
                }
                for sub in &subs {
                    outgoing.push((
                        sub.clone(),
                        StoreEvent::DataChanged {
                            path: node.clone(),
                            data: data.clone(),
                        },
                    ));
                }
            } else if !path.exists() {
                watches.recent.remove(path);
                for sub in &subs {
                    outgoing.push((sub.clone(), StoreEvent::DataDeleted { path: node.clone() }));
                }
            }
        }
    }

    for (sub, event) in outgoing {
        deliver(&sub, event);
    }
}

fn should_deliver(
    recent: &mut HashMap<PathBuf, (Instant, Vec<u8>)>,
    path: &Path,
    data: &[u8],
    now: Instant,
) -> bool {
    should_deliver_with_threshold(recent, path, data, now, DEBOUNCE_WINDOW)
}

/// Identical payloads for one file inside `threshold` collapse into one
/// delivery; a different payload is always delivered.
fn should_deliver_with_threshold(
    recent: &mut HashMap<PathBuf, (Instant, Vec<u8>)>,
    path: &Path,
    data: &[u8],
    now: Instant,
    threshold: Duration,
) -> bool {
    recent.retain(|_, (seen_at, _)| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match recent.get(path) {
        Some((seen_at, last)) if now.duration_since(*seen_at) < threshold && last == data => false,
        _ => {
            recent.insert(path.to_path_buf(), (now, data.to_vec()));
            true
        }
    }
}

impl NotificationStore for FsStore {
    fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        let dir = self.fs_path(path)?;
        fs::create_dir_all(&dir).map_err(|e| store_io_err(&dir, e))
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.fs_path(path)?;
        list_children(&dir).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NoNode {
                path: path.to_owned(),
            },
            _ => store_io_err(&dir, err),
        })
    }

    fn read_data(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let file = self.fs_path(path)?;
        match fs::metadata(&file) {
            Ok(meta) if meta.is_dir() => Ok(None),
            Ok(_) => fs::read(&file)
                .map(Some)
                .map_err(|e| store_io_err(&file, e)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NoNode {
                path: path.to_owned(),
            }),
            Err(err) => Err(store_io_err(&file, err)),
        }
    }

    fn subscribe_child_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError> {
        let dir = self.fs_path(path)?;
        if !dir.is_dir() {
            return Err(StoreError::NoNode {
                path: path.to_owned(),
            });
        }
        self.watch_dir(&dir)?;
        add_subscription(&mut lock(&self.watches).child_subs, dir, sub);
        Ok(())
    }

    fn subscribe_data_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError> {
        let file = self.fs_path(path)?;
        let Some(parent) = file.parent().filter(|p| p.is_dir()) else {
            return Err(StoreError::NoNode {
                path: path.to_owned(),
            });
        };
        self.watch_dir(parent)?;
        add_subscription(&mut lock(&self.watches).data_subs, file, sub);
        Ok(())
    }
}
