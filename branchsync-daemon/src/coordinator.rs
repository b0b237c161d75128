//! Owns every configured target's engine and watcher, the shared scheduler,
//! the handler registry and the notification-store connection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use branchsync_core::{parse_repo_name, Config, ConfigError, SourceMode, Target, TargetName};
use branchsync_sync::{ChangeHandler, HandlerRegistry, KeyedScheduler, RepositorySyncEngine, Vcs};

use crate::error::DaemonError;
use crate::paths::repo_watch_path;
use crate::store::{FsStore, NotificationStore};
use crate::watcher::TargetWatcher;

/// One row of [`SyncCoordinator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub repo_name: String,
    pub repo_dir: PathBuf,
    pub watch_path: String,
}

pub struct SyncCoordinator<V: Vcs> {
    source: SourceMode,
    store_connect: Option<String>,
    watch_root: String,
    scheduler: KeyedScheduler<TargetName>,
    handlers: HandlerRegistry,
    watchers: BTreeMap<TargetName, TargetWatcher<V>>,
    store: Mutex<Option<Arc<dyn NotificationStore>>>,
}

impl<V: Vcs> SyncCoordinator<V> {
    /// Build engines and watchers for every configured target. Must be called
    /// from within a tokio runtime.
    ///
    /// A repository URI without a name is fatal. A target whose credentials
    /// cannot be loaded is skipped with an error log.
    pub fn build(config: &Config, vcs: Arc<V>) -> Result<Self, DaemonError> {
        let scheduler = KeyedScheduler::new(config.workers)?;
        let handlers = HandlerRegistry::default();
        let mut watchers = BTreeMap::new();

        for target_config in &config.targets {
            parse_repo_name(&target_config.git_uri)?;
            let target = match Target::from_config(target_config, &config.deploy_prefix) {
                Ok(target) => target,
                Err(err) => {
                    tracing::error!(target = %target_config.name, error = %err, "skipping target");
                    continue;
                }
            };
            tracing::info!(
                target = %target.name,
                repo = %target.repo_name,
                dir = %target.layout.root().display(),
                "target configured",
            );
            let name = target.name.clone();
            let engine = Arc::new(RepositorySyncEngine::new(
                Arc::new(target),
                Arc::clone(&vcs),
                scheduler.clone(),
                handlers.clone(),
            ));
            watchers.insert(name, TargetWatcher::new(engine, scheduler.clone()));
        }

        Ok(Self {
            source: config.source,
            store_connect: config.store.connect.clone(),
            watch_root: config.store.watch_root.clone(),
            scheduler,
            handlers,
            watchers,
            store: Mutex::new(None),
        })
    }

    /// Open the store selected by the configuration: an [`FsStore`] for
    /// `source: fs`, nothing for `source: none`.
    pub fn connect(&self) -> Result<(), DaemonError> {
        match (self.source, &self.store_connect) {
            (SourceMode::Fs, Some(root)) => {
                let store = FsStore::connect(root)?;
                self.attach_store(Arc::new(store));
                Ok(())
            }
            (SourceMode::Fs, None) => Err(ConfigError::Invalid(
                "source 'fs' requires store.connect".to_string(),
            )
            .into()),
            (SourceMode::None, _) => Ok(()),
        }
    }

    /// Use `store` for every watcher started afterwards.
    pub fn attach_store(&self, store: Arc<dyn NotificationStore>) {
        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = Some(store);
    }

    /// Start every watcher once. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (name, watcher) in &self.watchers {
            let watch = store.as_ref().map(|store| {
                let path = repo_watch_path(&self.watch_root, &watcher.engine().target().repo_name);
                (Arc::clone(store), path)
            });
            if let Err(err) = watcher.start(watch) {
                tracing::error!(target = %name, error = %err, "watcher failed to start");
            }
        }
    }

    pub fn target_names(&self) -> Vec<TargetName> {
        self.watchers.keys().cloned().collect()
    }

    /// `<resource_directory>/<repo_name>` for a known target.
    pub fn find_repo_dir(&self, target: &str) -> Option<PathBuf> {
        self.watchers
            .get(&TargetName::from(target))
            .map(|w| w.engine().target().layout.root().to_path_buf())
    }

    pub fn add_handler(&self, handler: Arc<dyn ChangeHandler>) -> bool {
        self.handlers.add(handler)
    }

    pub fn remove_handler(&self, handler: &Arc<dyn ChangeHandler>) -> bool {
        self.handlers.remove(handler)
    }

    /// Schedule a branch sync regardless of notifications. Unknown targets
    /// are ignored; the result says whether the target was known.
    pub fn force_trigger(&self, target: &str, branch: &str) -> Result<bool, DaemonError> {
        let Some(watcher) = self.watchers.get(&TargetName::from(target)) else {
            tracing::debug!(%target, %branch, "force trigger for unknown target ignored");
            return Ok(false);
        };
        tracing::info!(%target, %branch, "force trigger");
        watcher.engine().schedule_branch(branch)?;
        Ok(true)
    }

    pub fn status(&self) -> Vec<TargetStatus> {
        self.watchers
            .values()
            .map(|w| {
                let target = w.engine().target();
                TargetStatus {
                    name: target.name.to_string(),
                    repo_name: target.repo_name.clone(),
                    repo_dir: target.layout.root().to_path_buf(),
                    watch_path: repo_watch_path(&self.watch_root, &target.repo_name),
                }
            })
            .collect()
    }

    pub fn scheduler(&self) -> &KeyedScheduler<TargetName> {
        &self.scheduler
    }

    /// Stop consuming notifications, stop accepting work and wait for every
    /// accepted unit to finish.
    pub async fn shutdown(&self) {
        for watcher in self.watchers.values() {
            watcher.stop();
        }
        self.scheduler.shutdown().await;
        tracing::info!("coordinator drained");
    }
}
