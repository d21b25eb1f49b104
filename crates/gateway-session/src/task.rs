//! Background task spawning for operations that reach the network.

use std::future::Future;

use tokio::runtime::{Builder, Handle};

/// Spawns helper tasks on the tokio runtime that created the helper.
///
/// Helpers created outside a runtime (e.g. on a UI thread) run each task on
/// a dedicated thread with its own current-thread runtime.
#[derive(Debug, Clone)]
pub(crate) struct TaskSpawner {
    handle: Option<Handle>,
}

impl TaskSpawner {
    pub(crate) fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    pub(crate) fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = &self.handle {
            handle.spawn(task);
            return;
        }

        let spawned = std::thread::Builder::new()
            .name(format!("gateway-session-{name}"))
            .spawn(move || match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime.block_on(task),
                Err(e) => tracing::error!(task = name, "Failed to build task runtime: {e}"),
            });
        if let Err(e) = spawned {
            tracing::error!(task = name, "Failed to spawn task thread: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn test_spawn_outside_runtime_uses_thread() {
        let spawner = TaskSpawner::current();
        assert!(spawner.handle.is_none());

        let (tx, rx) = std::sync::mpsc::channel();
        spawner.spawn("test", async move {
            tokio::task::yield_now().await;
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
        });
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("gateway-session-test"));
    }

    #[tokio::test]
    async fn test_spawn_inside_runtime_uses_handle() {
        let spawner = TaskSpawner::current();
        assert!(spawner.handle.is_some());

        let (tx, rx) = oneshot::channel();
        spawner.spawn("test", async move {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
