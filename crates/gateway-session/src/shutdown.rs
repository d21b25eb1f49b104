//! Process-exit hook registry.
//!
//! Connected session helpers register a hook that destroys their session so
//! that the gateway session is ended even when the process exits without an
//! explicit `destroy`. The application decides when the process is shutting
//! down and calls [`ProcessShutdown::run`], or lets
//! [`ProcessShutdown::listen_for_ctrl_c`] do it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use thiserror::Error;
use uuid::Uuid;

/// Identifies a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(Uuid);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cleanup action run once at process shutdown.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Hook registry error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("Shutdown already in progress")]
    ShuttingDown,
    #[error("Unknown shutdown hook: {0}")]
    Unknown(HookId),
}

/// Registration interface for process-exit hooks.
pub trait ShutdownHooks: Send + Sync {
    /// Register a hook.
    ///
    /// # Errors
    /// Returns error if shutdown has started.
    fn register(&self, hook: ShutdownHook) -> Result<HookId, HookError>;

    /// Unregister a hook without running it.
    ///
    /// # Errors
    /// Returns error if shutdown has started or the hook is unknown.
    fn unregister(&self, id: HookId) -> Result<(), HookError>;
}

#[derive(Default)]
struct Inner {
    hooks: HashMap<HookId, ShutdownHook>,
    shutting_down: bool,
}

/// Hook registry for the current process.
#[derive(Default)]
pub struct ProcessShutdown {
    inner: Mutex<Inner>,
}

impl ProcessShutdown {
    /// Create a standalone registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProcessShutdown>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Run every registered hook once. Later registrations are refused.
    ///
    /// Returns the number of hooks run.
    pub fn run(&self) -> usize {
        let hooks: Vec<ShutdownHook> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.shutting_down = true;
            inner.hooks.drain().map(|(_, hook)| hook).collect()
        };

        let count = hooks.len();
        tracing::debug!(count, "Running shutdown hooks");
        for hook in hooks {
            hook();
        }
        count
    }

    /// Whether [`run`](Self::run) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutting_down
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hooks
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the hooks when the process receives Ctrl-C.
    pub fn listen_for_ctrl_c(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Ctrl-C received, running shutdown hooks");
                    registry.run();
                }
                Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {e}"),
            }
        })
    }
}

impl ShutdownHooks for ProcessShutdown {
    fn register(&self, hook: ShutdownHook) -> Result<HookId, HookError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.shutting_down {
            return Err(HookError::ShuttingDown);
        }
        let id = HookId(Uuid::new_v4());
        inner.hooks.insert(id, hook);
        Ok(id)
    }

    fn unregister(&self, id: HookId) -> Result<(), HookError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.shutting_down {
            return Err(HookError::ShuttingDown);
        }
        inner
            .hooks
            .remove(&id)
            .map(drop)
            .ok_or(HookError::Unknown(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> ShutdownHook {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_run_executes_each_hook_once() {
        let registry = ProcessShutdown::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert_ok!(registry.register(counting_hook(&counter)));
        assert_ok!(registry.register(counting_hook(&counter)));

        assert_eq!(registry.run(), 2);
        assert_eq!(registry.run(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_hook_does_not_run() {
        let registry = ProcessShutdown::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = assert_ok!(registry.register(counting_hook(&counter)));
        assert_ok!(registry.unregister(id));
        assert_eq!(assert_err!(registry.unregister(id)), HookError::Unknown(id));

        registry.run();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_after_shutdown_is_refused() {
        let registry = ProcessShutdown::new();
        registry.run();
        assert!(registry.is_shutting_down());
        let counter = Arc::new(AtomicUsize::new(0));
        assert_eq!(
            assert_err!(registry.register(counting_hook(&counter))),
            HookError::ShuttingDown
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_hook_may_touch_registry() {
        let registry = Arc::new(ProcessShutdown::new());
        let inner = Arc::clone(&registry);
        assert_ok!(registry.register(Box::new(move || {
            // Runs outside the registry lock.
            assert!(inner.is_shutting_down());
        })));
        assert_eq!(registry.run(), 1);
    }
}
