//! Change-handler registry.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use branchsync_core::TargetName;

/// Listener notified after a branch checkout was brought up to date.
pub trait ChangeHandler: Send + Sync {
    fn on_repository_changed(&self, target: &TargetName, branch: &str, checkout_dir: &Path);
}

impl<F> ChangeHandler for F
where
    F: Fn(&TargetName, &str, &Path) + Send + Sync,
{
    fn on_repository_changed(&self, target: &TargetName, branch: &str, checkout_dir: &Path) {
        self(target, branch, checkout_dir)
    }
}

/// Set of handlers shared by every engine; identity is the `Arc` pointer.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn ChangeHandler>>>>,
}

fn same_handler(a: &Arc<dyn ChangeHandler>, b: &Arc<dyn ChangeHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl HandlerRegistry {
    /// Returns `false` if the handler was already registered.
    pub fn add(&self, handler: Arc<dyn ChangeHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Returns `false` if the handler was not registered.
    pub fn remove(&self, handler: &Arc<dyn ChangeHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler synchronously; the read lock is held only while
    /// iterating.
    pub fn notify(&self, target: &TargetName, branch: &str, checkout_dir: &Path) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler.on_repository_changed(target, branch, checkout_dir);
        }
    }
}
