//! Session helper: connects, keeps alive and destroys one gateway session.
//!
//! Every operation that reaches the network runs on a background task; the
//! state lock is never held across a remote call. Results are merged back
//! under the lock, where a pending destroy always wins over a connect that
//! is about to complete.

use std::{fmt, sync::Arc, time::Duration};

use gateway_session_core::{
    Communicator, Connection, Context, Heartbeat, Identity, KeepAlive, ObjectAdapter, ObjectPrx,
    RouterPrx, RpcError, RuntimeConfig, RuntimeFactory, Servant, SessionPrx,
};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::{
    Credentials, HookId, Phase, ProcessShutdown, SessionCallback, SessionError, ShutdownHooks,
    dispatch::CallbackDispatcher,
    state::{StateLock, Teardown},
    task::TaskSpawner,
};

/// How a connect sequence ended when it did not fail.
enum ConnectOutcome {
    /// Session committed; `connected` still has to be delivered.
    Connected(Option<Arc<dyn Connection>>),
    /// A destroy request won. Any notification has already been sent.
    Abandoned,
}

/// Manages the lifecycle of one gateway session.
///
/// A helper connects at most once. After it is destroyed a new helper is
/// needed for a new session.
pub struct SessionHelper {
    factory: Arc<dyn RuntimeFactory>,
    callback: Arc<dyn SessionCallback>,
    config: RuntimeConfig,
    finder: String,
    use_callbacks: bool,
    hooks: Arc<dyn ShutdownHooks>,
    dispatcher: CallbackDispatcher,
    spawner: TaskSpawner,
    state: StateLock,
}

impl SessionHelper {
    /// Create a helper that registers its exit hook with the process-wide
    /// [`ProcessShutdown`] registry.
    ///
    /// # Arguments
    /// * `factory` - Creates the runtime instance on connect
    /// * `callback` - Receives lifecycle notifications
    /// * `config` - Runtime initialization data, including the dispatcher
    /// * `finder` - Stringified proxy of the router finder
    /// * `use_callbacks` - Create an object adapter for callback objects
    #[must_use]
    pub fn new(
        factory: Arc<dyn RuntimeFactory>,
        callback: Arc<dyn SessionCallback>,
        config: RuntimeConfig,
        finder: impl Into<String>,
        use_callbacks: bool,
    ) -> Arc<Self> {
        Self::with_shutdown_hooks(
            factory,
            callback,
            config,
            finder,
            use_callbacks,
            ProcessShutdown::global(),
        )
    }

    /// Create a helper with its own exit hook registry.
    #[must_use]
    pub fn with_shutdown_hooks(
        factory: Arc<dyn RuntimeFactory>,
        callback: Arc<dyn SessionCallback>,
        config: RuntimeConfig,
        finder: impl Into<String>,
        use_callbacks: bool,
        hooks: Arc<dyn ShutdownHooks>,
    ) -> Arc<Self> {
        let dispatcher = CallbackDispatcher::new(config.dispatcher.clone());
        Arc::new(Self {
            factory,
            callback,
            config,
            finder: finder.into(),
            use_callbacks,
            hooks,
            dispatcher,
            spawner: TaskSpawner::current(),
            state: StateLock::new(),
        })
    }

    /// Connect using the identity established by the secure transport.
    ///
    /// # Errors
    /// See [`connect_with`](Self::connect_with).
    pub fn connect(self: &Arc<Self>, context: Context) -> Result<(), SessionError> {
        self.connect_with(Credentials::SecureConnection, context)
    }

    /// Connect with user name and password.
    ///
    /// # Errors
    /// See [`connect_with`](Self::connect_with).
    pub fn connect_with_password(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        context: Context,
    ) -> Result<(), SessionError> {
        self.connect_with(Credentials::password(username, password), context)
    }

    /// Start connecting in the background.
    ///
    /// The outcome is delivered to [`SessionCallback::connected`] or
    /// [`SessionCallback::connect_failed`].
    ///
    /// # Errors
    /// Returns [`SessionError::NotIdle`] if connect was already called or
    /// the helper was destroyed.
    pub fn connect_with(
        self: &Arc<Self>,
        credentials: Credentials,
        context: Context,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.phase() != Phase::Idle {
                return Err(SessionError::NotIdle(state.phase()));
            }
            state.set_phase(Phase::Connecting);
        }

        tracing::debug!(?credentials, finder = %self.finder, "Connecting to gateway");
        let helper = Arc::clone(self);
        self.spawner.spawn("connect", async move {
            helper.run_connect(credentials, context).await;
        });
        Ok(())
    }

    /// Destroy the session. Idempotent.
    ///
    /// Before the session is established this destroys the runtime
    /// instance, which makes the pending connect fail. Afterwards the
    /// session is ended in the background and
    /// [`SessionCallback::disconnected`] follows.
    pub fn destroy(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match state.phase() {
            Phase::DestroyRequested | Phase::Destroyed => {}
            Phase::Idle => state.set_phase(Phase::Destroyed),
            Phase::Connecting => {
                state.set_phase(Phase::DestroyRequested);
                let runtime = state.runtime.take();
                drop(state);

                if let Some(runtime) = runtime {
                    tracing::debug!("Destroying runtime to cancel connect");
                    self.spawner.spawn("cancel-connect", async move {
                        runtime.destroy().await;
                    });
                }
            }
            Phase::Connected => {
                let teardown = state.take_teardown();
                let exit_hook = state.exit_hook.take();
                state.set_phase(Phase::DestroyRequested);
                drop(state);

                if let Some(id) = exit_hook {
                    if let Err(e) = self.hooks.unregister(id) {
                        tracing::debug!("Shutdown hook not unregistered: {e}");
                    }
                }
                let helper = Arc::clone(self);
                self.spawner.spawn("destroy", async move {
                    helper.finalize_destroy(teardown).await;
                });
            }
        }
    }

    /// Category to use in the identities of callback objects.
    ///
    /// # Errors
    /// Returns [`SessionError::NoSession`] if no session is established.
    pub fn category_for_client(&self) -> Result<String, SessionError> {
        let state = self.state.lock();
        state.router()?;
        state.category.clone().ok_or(SessionError::NoSession)
    }

    /// Proxy of the established session.
    ///
    /// # Errors
    /// Returns [`SessionError::NoSession`] if no session is established.
    pub fn session(&self) -> Result<Arc<dyn SessionPrx>, SessionError> {
        self.state
            .lock()
            .session
            .clone()
            .ok_or(SessionError::NoSession)
    }

    /// Object adapter for callback objects.
    ///
    /// # Errors
    /// Returns [`SessionError::NoSession`] if no session is established, or
    /// [`SessionError::CallbacksDisabled`] if the helper was created
    /// without callback support.
    pub fn object_adapter(&self) -> Result<Arc<dyn ObjectAdapter>, SessionError> {
        self.state.lock().adapter(self.use_callbacks).cloned()
    }

    /// Add a callback servant under a fresh UUID in the client's category.
    ///
    /// # Errors
    /// Same as [`object_adapter`](Self::object_adapter), plus any adapter
    /// registration failure.
    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> Result<ObjectPrx, SessionError> {
        let state = self.state.lock();
        let adapter = state.adapter(self.use_callbacks)?;
        let category = state.category.clone().ok_or(SessionError::NoSession)?;
        let identity = Identity::new(Uuid::new_v4().to_string(), category);
        Ok(adapter.add(servant, identity)?)
    }

    /// Whether a session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    /// Runtime instance of the current connect attempt or session.
    #[must_use]
    pub fn communicator(&self) -> Option<Arc<dyn Communicator>> {
        self.state.lock().runtime.clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.current_phase()
    }

    /// Stream of phase changes, starting with the current phase.
    #[must_use]
    pub fn phase_stream(&self) -> WatchStream<Phase> {
        WatchStream::new(self.state.subscribe())
    }

    /// Wait until the phase satisfies `done`.
    pub async fn wait_for_phase(&self, mut done: impl FnMut(Phase) -> bool) -> Phase {
        let mut rx = self.state.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            if done(phase) || rx.changed().await.is_err() {
                return phase;
            }
        }
    }

    /// Wait until the helper reaches [`Phase::Destroyed`].
    pub async fn wait_destroyed(&self) {
        self.wait_for_phase(Phase::is_terminal).await;
    }

    #[must_use]
    pub fn finder(&self) -> &str {
        &self.finder
    }

    #[must_use]
    pub const fn use_callbacks(&self) -> bool {
        self.use_callbacks
    }

    async fn run_connect(self: Arc<Self>, credentials: Credentials, context: Context) {
        let runtime = match self.start_runtime().await {
            Ok(Some(runtime)) => runtime,
            Ok(None) => return,
            Err(error) => return self.fail_connect(None, error).await,
        };
        match self.establish(&runtime, &credentials, &context).await {
            Ok(ConnectOutcome::Connected(connection)) => self.deliver_connected(connection),
            Ok(ConnectOutcome::Abandoned) => {}
            Err(error) => self.fail_connect(Some(runtime), error).await,
        }
    }

    /// Initialize the runtime and publish it to `destroy`. `None` when a
    /// destroy request won first.
    async fn start_runtime(&self) -> Result<Option<Arc<dyn Communicator>>, SessionError> {
        if self.state.lock().phase() != Phase::Connecting {
            self.finish_cancelled();
            return Ok(None);
        }

        let runtime = self.factory.initialize(&self.config).await?;
        let cancelled = {
            let mut state = self.state.lock();
            if state.phase() == Phase::Connecting {
                state.runtime = Some(Arc::clone(&runtime));
                false
            } else {
                true
            }
        };
        if cancelled {
            runtime.destroy().await;
            self.finish_cancelled();
            return Ok(None);
        }
        Ok(Some(runtime))
    }

    async fn establish(
        self: &Arc<Self>,
        runtime: &Arc<dyn Communicator>,
        credentials: &Credentials,
        context: &Context,
    ) -> Result<ConnectOutcome, SessionError> {
        let router = self.resolve_router(runtime.as_ref()).await?;

        let helper = Arc::clone(self);
        self.dispatcher
            .dispatch_and_wait(move || helper.callback.created_communicator(&helper))
            .await?;

        let session = credentials.create_session(router.as_ref(), context).await?;
        self.finalize_connect(runtime, router, session).await
    }

    /// Destroy won before the runtime was used; nobody is notified.
    fn finish_cancelled(&self) {
        self.state.lock().set_phase(Phase::Destroyed);
        tracing::debug!("Connect cancelled before any session was created");
    }

    async fn resolve_router(
        &self,
        runtime: &dyn Communicator,
    ) -> Result<Arc<dyn RouterPrx>, RpcError> {
        if let Some(router) = runtime.default_router() {
            return Ok(router);
        }

        let finder = runtime.router_finder(&self.finder)?;
        let router = match finder.get_router().await {
            Ok(router) => router,
            Err(RpcError::CommunicatorDestroyed) => return Err(RpcError::CommunicatorDestroyed),
            Err(e) => {
                tracing::debug!(
                    "Router finder query failed, using the default router identity: {e}"
                );
                finder.router_with_identity(Identity::default_router())
            }
        };
        runtime.set_default_router(Arc::clone(&router));
        Ok(router)
    }

    async fn finalize_connect(
        self: &Arc<Self>,
        runtime: &Arc<dyn Communicator>,
        router: Arc<dyn RouterPrx>,
        session: Arc<dyn SessionPrx>,
    ) -> Result<ConnectOutcome, SessionError> {
        let connection = router.cached_connection();
        let category = router.category_for_client().await?;
        let keep_alive = negotiate_keep_alive(router.as_ref()).await?;

        // Creating a routed adapter makes a round trip to the router, so it
        // cannot wait for the first accessor call.
        let adapter = if self.use_callbacks {
            let adapter = runtime
                .create_object_adapter_with_router("", Arc::clone(&router))
                .await?;
            adapter.activate().await?;
            Some(adapter)
        } else {
            None
        };

        let abandoned = {
            let mut state = self.state.lock();
            if state.phase() == Phase::Connecting {
                state.router = Some(Arc::clone(&router));
                state.session = Some(session);
                state.category = Some(category);
                state.adapter = adapter;
                state.set_phase(Phase::Connected);
                state.exit_hook = self.register_exit_hook();
                None
            } else {
                // The cancel task may own the runtime too; destroying it
                // again waits for that teardown to finish.
                state.runtime = None;
                Some(Teardown {
                    router: Some(router),
                    runtime: Some(Arc::clone(runtime)),
                    adapter,
                })
            }
        };

        if let Some(teardown) = abandoned {
            tracing::debug!("Destroy requested while connecting, ending the new session");
            self.finalize_destroy(teardown).await;
            return Ok(ConnectOutcome::Abandoned);
        }

        // Outside the lock: a connection that is already closed runs the
        // close callback, which destroys the helper, immediately.
        if let Some(connection) = &connection {
            self.watch_connection(connection.as_ref(), keep_alive);
        }
        Ok(ConnectOutcome::Connected(connection))
    }

    fn watch_connection(
        self: &Arc<Self>,
        connection: &dyn Connection,
        keep_alive: Option<Duration>,
    ) {
        if let Some(timeout) = keep_alive {
            connection.set_keep_alive(KeepAlive::new(timeout, Heartbeat::Always));
        }

        let helper = Arc::downgrade(self);
        let description = connection.description();
        connection.set_close_callback(Box::new(move || {
            if let Some(helper) = helper.upgrade() {
                tracing::debug!(connection = %description, "Gateway connection closed");
                helper.destroy();
            }
        }));
    }

    fn register_exit_hook(self: &Arc<Self>) -> Option<HookId> {
        let helper = Arc::downgrade(self);
        let hook = Box::new(move || {
            if let Some(helper) = helper.upgrade() {
                helper.destroy();
            }
        });
        match self.hooks.register(hook) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::debug!("Shutdown hook not registered: {e}");
                None
            }
        }
    }

    fn deliver_connected(self: &Arc<Self>, connection: Option<Arc<dyn Connection>>) {
        let helper = Arc::clone(self);
        self.dispatcher.dispatch(
            move || match helper.callback.connected(&helper) {
                Ok(()) => {}
                Err(SessionError::NoSession) => helper.destroy(),
                Err(e) => tracing::warn!("Connected callback failed: {e}"),
            },
            connection,
        );
    }

    async fn fail_connect(
        self: &Arc<Self>,
        runtime: Option<Arc<dyn Communicator>>,
        error: SessionError,
    ) {
        self.state.lock().runtime = None;
        if let Some(runtime) = runtime {
            runtime.destroy().await;
        }
        self.state.lock().set_phase(Phase::Destroyed);

        tracing::debug!("Connect failed: {error}");
        let helper = Arc::clone(self);
        self.dispatcher.dispatch(
            move || helper.callback.connect_failed(&helper, &error),
            None,
        );
    }

    async fn finalize_destroy(self: &Arc<Self>, teardown: Teardown) {
        let Teardown {
            router,
            runtime,
            adapter,
        } = teardown;

        if let Some(router) = router {
            match router.destroy_session().await {
                Ok(()) => {}
                Err(e) if e.is_expected_on_destroy() => {
                    tracing::debug!("Session already gone: {e}");
                }
                // A destroy that cancelled the connect closed the
                // connection, and the session with it.
                Err(RpcError::CommunicatorDestroyed)
                    if runtime.as_ref().is_some_and(|r| r.is_destroyed()) =>
                {
                    tracing::debug!("Session ended with its runtime");
                }
                Err(e) => tracing::warn!("Unexpected error when destroying the session: {e}"),
            }
        }
        if let Some(adapter) = adapter {
            adapter.destroy();
        }
        if let Some(runtime) = runtime {
            runtime.destroy().await;
        }

        self.state.lock().set_phase(Phase::Destroyed);

        let helper = Arc::clone(self);
        self.dispatcher
            .dispatch(move || helper.callback.disconnected(&helper), None);
    }
}

impl fmt::Debug for SessionHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHelper")
            .field("finder", &self.finder)
            .field("use_callbacks", &self.use_callbacks)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Keep-alive interval negotiated with the gateway.
///
/// Gateways without keep-alive support report the query as an unknown
/// operation; the session timeout is used instead. `None` when neither
/// value is positive.
async fn negotiate_keep_alive(router: &dyn RouterPrx) -> Result<Option<Duration>, RpcError> {
    let timeout = match router.keep_alive_timeout().await {
        Ok(timeout) => i64::from(timeout),
        Err(e) if e.is_unsupported() => 0,
        Err(e) => return Err(e),
    };
    let timeout = if timeout > 0 {
        timeout
    } else {
        router.session_timeout().await?
    };
    Ok(u64::try_from(timeout)
        .ok()
        .filter(|t| *t > 0)
        .map(Duration::from_secs))
}
