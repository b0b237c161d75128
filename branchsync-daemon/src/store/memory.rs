//! In-process [`NotificationStore`], used by tests and embedders.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{deliver, parent_path, NotificationStore, StoreEvent, Subscription};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    /// Node path to data. Interior nodes created by `ensure_path` have none.
    nodes: BTreeMap<String, Option<Vec<u8>>>,
    child_subs: HashMap<String, Vec<Subscription>>,
    data_subs: HashMap<String, Vec<Subscription>>,
}

impl State {
    fn children_of(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|node| parent_path(node) == Some(path))
            .filter_map(|node| node.rsplit('/').next())
            .map(str::to_owned)
            .collect()
    }

    /// Create `path` and its ancestors; returns the paths that were new.
    fn create_all(&mut self, path: &str) -> Vec<String> {
        let mut created = Vec::new();
        let mut cursor = Some(path);
        while let Some(node) = cursor {
            if node == "/" || self.nodes.contains_key(node) {
                break;
            }
            self.nodes.insert(node.to_owned(), None);
            created.push(node.to_owned());
            cursor = parent_path(node);
        }
        created
    }

    fn child_events(&self, created: &[String]) -> Vec<(Subscription, StoreEvent)> {
        let mut out = Vec::new();
        for node in created {
            let Some(parent) = parent_path(node) else { continue };
            for sub in self.child_subs.get(parent).into_iter().flatten() {
                out.push((
                    sub.clone(),
                    StoreEvent::ChildrenChanged {
                        path: parent.to_owned(),
                        children: self.children_of(parent),
                    },
                ));
            }
        }
        out
    }
}

fn add_subscription(subs: &mut HashMap<String, Vec<Subscription>>, path: &str, sub: &Subscription) {
    let entry = subs.entry(path.to_owned()).or_default();
    if !entry.iter().any(|s| s.id == sub.id) {
        entry.push(sub.clone());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `data` at `path`, creating it (and ancestors) if needed.
    pub fn set_data(&self, path: &str, data: &[u8]) {
        let events = {
            let mut state = self.lock();
            let created = state.create_all(path);
            state.nodes.insert(path.to_owned(), Some(data.to_vec()));
            let mut events = state.child_events(&created);
            for sub in state.data_subs.get(path).into_iter().flatten() {
                events.push((
                    sub.clone(),
                    StoreEvent::DataChanged {
                        path: path.to_owned(),
                        data: data.to_vec(),
                    },
                ));
            }
            events
        };
        for (sub, event) in events {
            deliver(&sub, event);
        }
    }

    /// Remove `path` and its descendants.
    pub fn delete(&self, path: &str) {
        let events = {
            let mut state = self.lock();
            let prefix = format!("{path}/");
            let removed: Vec<String> = state
                .nodes
                .keys()
                .filter(|node| *node == path || node.starts_with(&prefix))
                .cloned()
                .collect();
            if removed.is_empty() {
                return;
            }
            for node in &removed {
                state.nodes.remove(node);
            }
            let mut events = Vec::new();
            for node in &removed {
                for sub in state.data_subs.get(node).into_iter().flatten() {
                    events.push((sub.clone(), StoreEvent::DataDeleted { path: node.clone() }));
                }
            }
            if let Some(parent) = parent_path(path) {
                for sub in state.child_subs.get(parent).into_iter().flatten() {
                    events.push((
                        sub.clone(),
                        StoreEvent::ChildrenChanged {
                            path: parent.to_owned(),
                            children: state.children_of(parent),
                        },
                    ));
                }
            }
            events
        };
        for (sub, event) in events {
            deliver(&sub, event);
        }
    }
}

impl NotificationStore for MemoryStore {
    fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        let events = {
            let mut state = self.lock();
            let created = state.create_all(path);
            state.child_events(&created)
        };
        for (sub, event) in events {
            deliver(&sub, event);
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_owned(),
            });
        }
        Ok(state.children_of(path))
    }

    fn read_data(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.lock()
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_owned(),
            })
    }

    fn subscribe_child_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError> {
        add_subscription(&mut self.lock().child_subs, path, sub);
        Ok(())
    }

    fn subscribe_data_changes(&self, path: &str, sub: &Subscription) -> Result<(), StoreError> {
        add_subscription(&mut self.lock().data_subs, path, sub);
        Ok(())
    }
}

impl MemoryStore {
    /// Number of distinct subscribers on `path` (child and data).
    pub fn subscriber_count(&self, path: &str) -> (usize, usize) {
        let state = self.lock();
        (
            state.child_subs.get(path).map_or(0, Vec::len),
            state.data_subs.get(path).map_or(0, Vec::len),
        )
    }
}
