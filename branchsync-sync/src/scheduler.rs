//! Keyed ordering on top of a bounded worker pool.
//!
//! Units submitted with the same key run strictly one at a time, in
//! submission order. Units with different keys, or with no key, run
//! concurrently up to the pool size.
//!
//! ## Queue protocol
//!
//! 1. `submit(Some(k))` with no queue for `k`: create an empty queue and
//!    dispatch the unit.
//! 2. `submit(Some(k))` with a queue: append; the unit waits.
//! 3. When a keyed unit finishes (ok, error or panic): pop the next unit for
//!    `k` and dispatch it, or remove the empty queue.
//!
//! A key has a queue iff one of its units is queued or running. Dispatch
//! always happens outside the key-map lock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};

use crate::error::SchedulerError;

/// A unit of blocking work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle to a shared keyed scheduler.
pub struct KeyedScheduler<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyedScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    runtime: Handle,
    permits: Arc<Semaphore>,
    queues: Mutex<HashMap<K, VecDeque<Job>>>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl<K> KeyedScheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Build a scheduler on the current tokio runtime with `workers`
    /// concurrent units.
    pub fn new(workers: usize) -> Result<Self, SchedulerError> {
        Ok(Self::with_handle(Handle::try_current()?, workers))
    }

    pub fn with_handle(runtime: Handle, workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                queues: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Enqueue `work`. Never waits for `work` (or any other unit) to run.
    pub fn submit<F>(&self, key: Option<K>, work: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        // Count the unit before checking `accepting`, so a `shutdown` that
        // stores `accepting = false` after this check still waits for it.
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.release_one();
            return Err(SchedulerError::ShutDown);
        }
        let job: Job = Box::new(work);

        let Some(key) = key else {
            Inner::dispatch(&self.inner, None, job);
            return Ok(());
        };

        {
            let mut queues = self.inner.lock_queues();
            if let Some(queue) = queues.get_mut(&key) {
                queue.push_back(job);
                return Ok(());
            }
            queues.insert(key.clone(), VecDeque::new());
        }
        Inner::dispatch(&self.inner, Some(key), job);
        Ok(())
    }

    /// Number of keys with a queued or running unit.
    pub fn pending_keys(&self) -> usize {
        self.inner.lock_queues().len()
    }

    /// Number of accepted units that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting units and wait until every accepted unit has finished,
    /// including units still queued behind a key.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<K, VecDeque<Job>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(this: &Arc<Self>, key: Option<K>, job: Job) {
        let inner = Arc::clone(this);
        this.runtime.spawn(async move {
            let permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
            let outcome = tokio::task::spawn_blocking(job).await;
            drop(permit);
            if let Err(err) = outcome {
                tracing::error!(error = %err, "scheduled unit panicked");
            }
            inner.finish(key);
        });
    }

    fn finish(self: Arc<Self>, key: Option<K>) {
        if let Some(key) = key {
            let next = {
                let mut queues = self.lock_queues();
                match queues.get_mut(&key).map(VecDeque::pop_front) {
                    Some(Some(job)) => Some(job),
                    Some(None) => {
                        queues.remove(&key);
                        None
                    }
                    None => None,
                }
            };
            if let Some(job) = next {
                Self::dispatch(&self, Some(key), job);
            }
        }

        self.release_one();
    }

    fn release_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_removed_once_drained() {
        let scheduler = KeyedScheduler::<&'static str>::new(2).expect("scheduler");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        scheduler
            .submit(Some("app"), move || {
                gate_rx.recv().expect("gate");
            })
            .expect("submit");
        scheduler
            .submit(Some("app"), move || done_tx.send(()).expect("done"))
            .expect("submit");
        assert_eq!(scheduler.pending_keys(), 1);

        gate_tx.send(()).expect("open gate");
        tokio::task::spawn_blocking(move || {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("second unit ran");
        })
        .await
        .expect("join");

        scheduler.shutdown().await;
        assert_eq!(scheduler.pending_keys(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let scheduler = KeyedScheduler::<u8>::new(1).expect("scheduler");
        scheduler.shutdown().await;
        assert!(!scheduler.is_accepting());
        let err = scheduler.submit(Some(1), || {}).unwrap_err();
        assert!(matches!(err, SchedulerError::ShutDown));
    }

    #[tokio::test]
    async fn rejected_submit_does_not_leak_in_flight() {
        let scheduler = KeyedScheduler::<u8>::new(1).expect("scheduler");
        scheduler.shutdown().await;
        for _ in 0..3 {
            assert!(scheduler.submit(None, || {}).is_err());
        }
        assert_eq!(scheduler.in_flight(), 0);
        scheduler.shutdown().await;
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(matches!(
            KeyedScheduler::<u8>::new(1),
            Err(SchedulerError::NoRuntime(_))
        ));
    }
}
