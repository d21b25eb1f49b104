//! Notification delivery through the application's dispatcher.

use std::sync::Arc;

use gateway_session_core::{Connection, Dispatcher};
use tokio::sync::oneshot;

use crate::DispatchError;

/// Runs notifications directly, or hands them to the configured dispatcher.
#[derive(Clone, Default)]
pub(crate) struct CallbackDispatcher {
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl CallbackDispatcher {
    pub(crate) const fn new(dispatcher: Option<Arc<dyn Dispatcher>>) -> Self {
        Self { dispatcher }
    }

    /// Fire-and-forget delivery.
    pub(crate) fn dispatch<F>(&self, call: F, connection: Option<Arc<dyn Connection>>)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(Box::new(call), connection),
            None => call(),
        }
    }

    /// Deliver and wait until the notification has run.
    ///
    /// # Errors
    /// Returns [`DispatchError::Dropped`] if the dispatcher discards the
    /// call (or it panics) instead of running it to completion.
    pub(crate) async fn dispatch_and_wait<F>(&self, call: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(dispatcher) = &self.dispatcher else {
            call();
            return Ok(());
        };

        let (done_tx, done_rx) = oneshot::channel();
        dispatcher.dispatch(
            Box::new(move || {
                call();
                let _ = done_tx.send(());
            }),
            None,
        );
        done_rx.await.map_err(|_| DispatchError::Dropped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use gateway_session_core::DispatchCall;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    /// Dispatcher that queues calls until `run_all`.
    #[derive(Default)]
    struct QueueDispatcher {
        queue: Mutex<Vec<DispatchCall>>,
    }

    impl QueueDispatcher {
        fn run_all(&self) -> usize {
            let calls: Vec<_> = self.queue.lock().unwrap().drain(..).collect();
            let n = calls.len();
            for call in calls {
                call();
            }
            n
        }
    }

    impl Dispatcher for QueueDispatcher {
        fn dispatch(&self, call: DispatchCall, _connection: Option<Arc<dyn Connection>>) {
            self.queue.lock().unwrap().push(call);
        }
    }

    #[test]
    fn test_direct_dispatch_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        CallbackDispatcher::default().dispatch(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_is_deferred_to_dispatcher() {
        let queue = Arc::new(QueueDispatcher::default());
        let dispatcher = CallbackDispatcher::new(Some(Arc::clone(&queue) as Arc<dyn Dispatcher>));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        dispatcher.dispatch(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_all(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_blocks_until_run() {
        let queue = Arc::new(QueueDispatcher::default());
        let dispatcher = CallbackDispatcher::new(Some(Arc::clone(&queue) as Arc<dyn Dispatcher>));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);

        let waiter = tokio::spawn(async move {
            dispatcher
                .dispatch_and_wait(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .await
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Poll until the call lands in the queue, then run it.
        while queue.run_all() == 0 {
            tokio::task::yield_now().await;
        }
        assert_ok!(waiter.await.unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_reports_dropped_call() {
        let dropping = |call: DispatchCall, _conn: Option<Arc<dyn Connection>>| drop(call);
        let dispatcher = CallbackDispatcher::new(Some(Arc::new(dropping) as Arc<dyn Dispatcher>));
        let result = dispatcher.dispatch_and_wait(|| {}).await;
        assert_eq!(assert_err!(result), DispatchError::Dropped);
    }
}
