//! Shared backend lifecycle
//!
//! The native compute backend and its log forwarder are process-wide. Every
//! runner holds one reference; bring-up happens on the 0→1 transition and
//! teardown on 1→0.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend initialization failed: {0}")]
    Init(String),
}

/// Side effects run on refcount transitions
pub trait BackendHooks: Send + Sync {
    fn bring_up(&self) -> Result<(), BackendError>;
    fn tear_down(&self);
}

/// Hooks for builds without a native backend
#[derive(Debug, Default)]
pub struct NoopHooks;

impl BackendHooks for NoopHooks {
    fn bring_up(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn tear_down(&self) {}
}

pub struct BackendManager {
    count: AtomicUsize,
    /// Held across bring-up and teardown so nobody sees a half-built backend
    transition: Mutex<()>,
    hooks: Box<dyn BackendHooks>,
}

static GLOBAL: Lazy<Arc<BackendManager>> =
    Lazy::new(|| Arc::new(BackendManager::new(default_hooks())));

#[cfg(feature = "native")]
fn default_hooks() -> Box<dyn BackendHooks> {
    Box::new(super::llama::NativeBackendHooks)
}

#[cfg(not(feature = "native"))]
fn default_hooks() -> Box<dyn BackendHooks> {
    Box::new(NoopHooks)
}

impl BackendManager {
    pub fn new(hooks: Box<dyn BackendHooks>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            transition: Mutex::new(()),
            hooks,
        }
    }

    /// Process-wide manager used by runners unless told otherwise.
    pub fn global() -> Arc<BackendManager> {
        Arc::clone(&GLOBAL)
    }

    pub fn refcount(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) -> Result<(), BackendError> {
        // Already up: just bump.
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }

        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        // Zero can only be left while holding the lock.
        if self.count.load(Ordering::Acquire) == 0 {
            self.hooks.bring_up()?;
            tracing::info!("Compute backend initialized");
            self.count.store(1, Ordering::Release);
        } else {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn release(&self) {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 1 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }

        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current == 0 {
                tracing::warn!("Backend release without a matching add_ref");
                return;
            }
            if self
                .count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if current == 1 {
                    self.hooks.tear_down();
                    tracing::info!("Compute backend released");
                }
                return;
            }
        }
    }

    /// Take a reference that is released when dropped.
    pub fn acquire(self: &Arc<Self>) -> Result<BackendRef, BackendError> {
        self.add_ref()?;
        Ok(BackendRef {
            manager: Arc::clone(self),
        })
    }
}

impl std::fmt::Debug for BackendManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendManager")
            .field("count", &self.refcount())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct BackendRef {
    manager: Arc<BackendManager>,
}

impl Drop for BackendRef {
    fn drop(&mut self) {
        self.manager.release();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::thread;

    #[test]
    fn test_hooks_run_on_transitions_only() {
        let (manager, ups, downs) = counting_manager();
        manager.add_ref().unwrap();
        manager.add_ref().unwrap();
        assert_eq!(manager.refcount(), 2);
        assert_eq!(ups.load(Ordering::SeqCst), 1);

        manager.release();
        assert_eq!(downs.load(Ordering::SeqCst), 0);
        manager.release();
        assert_eq!(manager.refcount(), 0);
        assert_eq!(downs.load(Ordering::SeqCst), 1);

        manager.add_ref().unwrap();
        assert_eq!(ups.load(Ordering::SeqCst), 2);
        manager.release();
    }

    #[test]
    fn test_release_at_zero_is_noop() {
        let (manager, _ups, downs) = counting_manager();
        manager.release();
        assert_eq!(manager.refcount(), 0);
        assert_eq!(downs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_bring_up_leaves_count_at_zero() {
        let hooks = CountingHooks {
            fail_bring_up: true,
            ..CountingHooks::default()
        };
        let manager = Arc::new(BackendManager::new(Box::new(hooks)));
        assert!(manager.acquire().is_err());
        assert_eq!(manager.refcount(), 0);
    }

    #[test]
    fn test_backend_ref_releases_on_drop() {
        let (manager, _ups, downs) = counting_manager();
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        drop(first);
        assert_eq!(manager.refcount(), 1);
        drop(second);
        assert_eq!(manager.refcount(), 0);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_refs() {
        let (manager, ups, downs) = counting_manager();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let held = manager.acquire().unwrap();
                        drop(held);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.refcount(), 0);
        assert_eq!(ups.load(Ordering::SeqCst), downs.load(Ordering::SeqCst));
        assert!(ups.load(Ordering::SeqCst) >= 1);
    }
}
