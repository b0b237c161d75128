//! Per-target change watcher.
//!
//! `start` creates the repository root, schedules the initial master sync
//! and, when a store is attached, subscribes to the repository's watch node.
//! Store events arrive on a bounded channel; one consumer task turns them
//! into scheduler submissions, so the store's delivery path never waits on a
//! sync.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use branchsync_core::{ChangeEvent, TargetName};
use branchsync_sync::{KeyedScheduler, RepositorySyncEngine, Vcs};

use crate::error::{io_err, DaemonError, StoreError};
use crate::paths::EVENT_CHANNEL_CAPACITY;
use crate::store::{child_path, NotificationStore, StoreEvent, Subscription, SubscriptionId};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

pub struct TargetWatcher<V: Vcs> {
    engine: Arc<RepositorySyncEngine<V>>,
    scheduler: KeyedScheduler<TargetName>,
    subscription_id: SubscriptionId,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// State shared by the consumer task and the units it schedules.
struct WatchContext<V: Vcs> {
    engine: Arc<RepositorySyncEngine<V>>,
    scheduler: KeyedScheduler<TargetName>,
    store: Arc<dyn NotificationStore>,
    subscription: Subscription,
    watch_path: String,
}

impl<V: Vcs> TargetWatcher<V> {
    pub fn new(engine: Arc<RepositorySyncEngine<V>>, scheduler: KeyedScheduler<TargetName>) -> Self {
        Self {
            engine,
            scheduler,
            subscription_id: NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed),
            consumer: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<RepositorySyncEngine<V>> {
        &self.engine
    }

    /// Must be called from within a tokio runtime when `store` is `Some`.
    pub fn start(
        &self,
        store: Option<(Arc<dyn NotificationStore>, String)>,
    ) -> Result<(), DaemonError> {
        let target = self.engine.target();
        let root = target.layout.root();
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        self.engine.schedule_master()?;

        let Some((store, watch_path)) = store else {
            tracing::info!(target = %target.name, "no notification store; skipping watch");
            return Ok(());
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = Arc::new(WatchContext {
            engine: Arc::clone(&self.engine),
            scheduler: self.scheduler.clone(),
            store,
            subscription: Subscription {
                id: self.subscription_id,
                tx,
            },
            watch_path,
        });

        let handle = tokio::spawn(consume(Arc::clone(&ctx), rx));
        if let Some(previous) = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }

        let unit = Arc::clone(&ctx);
        self.scheduler.submit(None, move || {
            if let Err(err) = unit.subscribe_all() {
                tracing::error!(
                    target = %unit.engine.target().name,
                    path = %unit.watch_path,
                    error = %err,
                    "could not subscribe to watch node",
                );
            }
        })?;
        Ok(())
    }

    /// Stop consuming store events. Units already scheduled still run.
    pub fn stop(&self) {
        if let Some(handle) = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn consume<V: Vcs>(ctx: Arc<WatchContext<V>>, mut rx: mpsc::Receiver<StoreEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            StoreEvent::ChildrenChanged { path, children } if path == ctx.watch_path => {
                let unit = Arc::clone(&ctx);
                let submitted = ctx.scheduler.submit(None, move || {
                    unit.refresh_children(&children);
                });
                if let Err(err) = submitted {
                    tracing::warn!(error = %err, "dropping child-change notification");
                }
            }
            StoreEvent::ChildrenChanged { .. } => {}
            StoreEvent::DataChanged { path, data } => ctx.handle_data(&path, &data),
            StoreEvent::DataDeleted { path } => {
                tracing::debug!(%path, "watch node deleted; ignoring");
            }
        }
    }
}

impl<V: Vcs> WatchContext<V> {
    fn target(&self) -> &TargetName {
        &self.engine.target().name
    }

    fn subscribe_all(&self) -> Result<(), StoreError> {
        self.store.ensure_path(&self.watch_path)?;
        for child in self.store.children(&self.watch_path)? {
            self.store
                .subscribe_data_changes(&child_path(&self.watch_path, &child), &self.subscription)?;
        }
        self.store
            .subscribe_child_changes(&self.watch_path, &self.subscription)?;
        tracing::info!(target = %self.target(), path = %self.watch_path, "watching for branch changes");
        Ok(())
    }

    /// Re-subscribe every current child, then treat each child's data as a
    /// fresh data change.
    fn refresh_children(&self, children: &[String]) {
        for child in children {
            let path = child_path(&self.watch_path, child);
            if let Err(err) = self.store.subscribe_data_changes(&path, &self.subscription) {
                tracing::warn!(target = %self.target(), %path, error = %err, "could not subscribe");
            }
        }
        for child in children {
            let path = child_path(&self.watch_path, child);
            match self.store.read_data(&path) {
                Ok(Some(data)) => self.handle_data(&path, &data),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(target = %self.target(), %path, error = %err, "could not read node")
                }
            }
        }
    }

    fn handle_data(&self, path: &str, data: &[u8]) {
        let event = match ChangeEvent::from_notification(self.target(), path, data) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(target = %self.target(), %path, error = %err, "malformed change payload");
                return;
            }
        };
        if !event.indicates_change() {
            tracing::debug!(target = %self.target(), branch = %event.branch, "no change indicated");
            return;
        }
        tracing::info!(
            target = %self.target(),
            branch = %event.branch,
            before = ?event.markers.before,
            after = ?event.markers.after,
            "change notification",
        );
        if let Err(err) = self.engine.schedule_branch(&event.branch) {
            tracing::warn!(target = %self.target(), branch = %event.branch, error = %err, "branch not scheduled");
        }
    }
}
