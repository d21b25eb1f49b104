//! In-memory runtime and gateway.
//!
//! Useful for tests, demos and offline development. Invocations never leave
//! the process: each one waits for the configured latency and fails with
//! `CommunicatorDestroyed` if its runtime instance is destroyed meanwhile,
//! or `ConnectionLost` once the gateway dropped the connection.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use gateway_session_core::{
    CloseCallback, Communicator, Connection, Context, Identity, KeepAlive, ObjectAdapter,
    ObjectPrx, ProxyString, RouterFinderPrx, RouterPrx, RpcError, RuntimeConfig, RuntimeFactory,
    Servant, SessionPrx,
};
use tokio::sync::watch;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

async fn wait_until_destroyed(destroyed: &mut watch::Receiver<bool>) {
    let closed = destroyed.wait_for(|destroyed| *destroyed).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

type QueryHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct GatewaySettings {
    accounts: HashMap<String, String>,
    secure_clients: bool,
    category: Option<String>,
    session_timeout: i64,
    keep_alive_timeout: Option<i32>,
    latency: Duration,
    finder_available: bool,
    router_identity: Identity,
    session_rejection: Option<String>,
    destroy_session_error: Option<RpcError>,
    initialization_error: Option<String>,
    keep_alive_hook: Option<QueryHook>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            accounts: HashMap::new(),
            secure_clients: true,
            category: None,
            session_timeout: 60,
            keep_alive_timeout: Some(30),
            latency: Duration::ZERO,
            finder_available: true,
            router_identity: Identity::default_router(),
            session_rejection: None,
            destroy_session_error: None,
            initialization_error: None,
            keep_alive_hook: None,
        }
    }
}

#[derive(Default)]
struct GatewayInner {
    settings: Mutex<GatewaySettings>,
    runtimes_created: AtomicUsize,
    live_runtimes: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_destroyed: AtomicUsize,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    last_context: Mutex<Option<Context>>,
}

/// A simulated gateway shared by every runtime instance its factory
/// creates.
///
/// Configure it with the `with_*` builders, then hand
/// [`factory`](Self::factory) to a session helper.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<GatewayInner>,
}

impl MemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(self, update: impl FnOnce(&mut GatewaySettings)) -> Self {
        update(&mut lock(&self.inner.settings));
        self
    }

    fn settings(&self) -> GatewaySettings {
        lock(&self.inner.settings).clone()
    }

    /// Accept `username` with `password`.
    #[must_use]
    pub fn with_account(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let (username, password) = (username.into(), password.into());
        self.configure(|s| {
            s.accounts.insert(username, password);
        })
    }

    /// Accept or refuse sessions from the secure transport's identity.
    #[must_use]
    pub fn with_secure_connections(self, accept: bool) -> Self {
        self.configure(|s| s.secure_clients = accept)
    }

    /// Category reported to every client. A fresh category per runtime
    /// instance otherwise.
    #[must_use]
    pub fn with_category(self, category: impl Into<String>) -> Self {
        let category = category.into();
        self.configure(|s| s.category = Some(category))
    }

    /// Session timeout in seconds.
    #[must_use]
    pub fn with_session_timeout(self, secs: i64) -> Self {
        self.configure(|s| s.session_timeout = secs)
    }

    /// Keep-alive timeout in seconds. `None` simulates a gateway without
    /// the keep-alive query.
    #[must_use]
    pub fn with_keep_alive_timeout(self, secs: Option<i32>) -> Self {
        self.configure(|s| s.keep_alive_timeout = secs)
    }

    /// Delay applied to runtime initialization and every invocation.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.configure(|s| s.latency = latency)
    }

    /// Whether the router finder answers queries.
    #[must_use]
    pub fn with_router_finder(self, available: bool) -> Self {
        self.configure(|s| s.finder_available = available)
    }

    #[must_use]
    pub fn with_router_identity(self, identity: Identity) -> Self {
        self.configure(|s| s.router_identity = identity)
    }

    /// Refuse every create-session call with `CannotCreateSession`.
    #[must_use]
    pub fn with_session_rejection(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.configure(|s| s.session_rejection = Some(reason))
    }

    /// Fail every destroy-session call with `error`.
    #[must_use]
    pub fn with_destroy_session_error(self, error: RpcError) -> Self {
        self.configure(|s| s.destroy_session_error = Some(error))
    }

    /// Fail runtime initialization.
    #[must_use]
    pub fn with_initialization_failure(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.configure(|s| s.initialization_error = Some(reason))
    }

    /// Run `hook` inside every keep-alive query, before it answers.
    #[must_use]
    pub fn on_keep_alive_query(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        let hook: QueryHook = Arc::new(hook);
        self.configure(|s| s.keep_alive_hook = Some(hook))
    }

    /// Runtime factory connected to this gateway.
    #[must_use]
    pub fn factory(&self) -> Arc<MemoryRuntimeFactory> {
        Arc::new(MemoryRuntimeFactory {
            gateway: self.clone(),
        })
    }

    #[must_use]
    pub fn router_identity(&self) -> Identity {
        self.settings().router_identity
    }

    /// Runtime instances created so far.
    #[must_use]
    pub fn runtimes_created(&self) -> usize {
        self.inner.runtimes_created.load(Ordering::SeqCst)
    }

    /// Runtime instances created and not yet destroyed.
    #[must_use]
    pub fn live_runtimes(&self) -> usize {
        self.inner.live_runtimes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.inner.sessions_created.load(Ordering::SeqCst)
    }

    /// Sessions created and not yet ended.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions_created()
            .saturating_sub(self.inner.sessions_destroyed.load(Ordering::SeqCst))
    }

    /// Context of the most recent create-session call.
    #[must_use]
    pub fn last_context(&self) -> Option<Context> {
        lock(&self.inner.last_context).clone()
    }

    /// Open client connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut connections = lock(&self.inner.connections);
        connections.retain(|c| c.strong_count() > 0);
        connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Close every open client connection. Returns how many were closed.
    pub fn drop_connections(&self) -> usize {
        let connections = self.connections();
        for connection in &connections {
            connection.close();
        }
        connections.len()
    }

    fn session_ended(&self) {
        self.inner.sessions_destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGateway")
            .field("router_identity", &self.router_identity())
            .field("live_runtimes", &self.live_runtimes())
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

/// Creates runtime instances connected to a [`MemoryGateway`].
#[derive(Debug, Clone)]
pub struct MemoryRuntimeFactory {
    gateway: MemoryGateway,
}

#[async_trait]
impl RuntimeFactory for MemoryRuntimeFactory {
    async fn initialize(&self, config: &RuntimeConfig) -> Result<Arc<dyn Communicator>, RpcError> {
        let settings = self.gateway.settings();
        delay(settings.latency).await;
        if let Some(reason) = settings.initialization_error.clone() {
            return Err(RpcError::Initialization(reason));
        }
        let communicator: Arc<dyn Communicator> =
            MemoryCommunicator::new(self.gateway.clone(), config, &settings)?;
        Ok(communicator)
    }
}

/// Runtime instance with a single connection to the gateway.
pub struct MemoryCommunicator {
    gateway: MemoryGateway,
    this: Weak<Self>,
    destroyed: watch::Sender<bool>,
    torn_down: watch::Sender<bool>,
    connection: Arc<MemoryConnection>,
    default_router: Mutex<Option<Arc<dyn RouterPrx>>>,
    adapters: Mutex<Vec<Arc<MemoryObjectAdapter>>>,
    session: Mutex<Option<Identity>>,
    category: String,
}

impl MemoryCommunicator {
    fn new(
        gateway: MemoryGateway,
        config: &RuntimeConfig,
        settings: &GatewaySettings,
    ) -> Result<Arc<Self>, RpcError> {
        let static_router = config
            .property(RuntimeConfig::DEFAULT_ROUTER)
            .map(str::parse::<ProxyString>)
            .transpose()?;

        let id = gateway.inner.runtimes_created.fetch_add(1, Ordering::SeqCst) + 1;
        gateway.inner.live_runtimes.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MemoryConnection::new(format!(
            "memory gateway connection #{id}"
        )));
        lock(&gateway.inner.connections).push(Arc::downgrade(&connection));
        let category = settings
            .category
            .clone()
            .unwrap_or_else(|| format!("client-{}", Uuid::new_v4().simple()));
        let (destroyed, _) = watch::channel(false);
        let (torn_down, _) = watch::channel(false);
        tracing::debug!(id, "Memory runtime initialized");

        Ok(Arc::new_cyclic(|this: &Weak<Self>| {
            let default_router =
                static_router.map(|proxy| MemoryRouter::new(Weak::clone(this), proxy.identity));
            Self {
                gateway,
                this: Weak::clone(this),
                destroyed,
                torn_down,
                connection,
                default_router: Mutex::new(default_router),
                adapters: Mutex::default(),
                session: Mutex::default(),
                category,
            }
        }))
    }

    #[must_use]
    pub fn connection(&self) -> Arc<MemoryConnection> {
        Arc::clone(&self.connection)
    }

    /// One simulated round trip: wait out the latency, then run `op`.
    async fn invoke<T>(
        &self,
        op: impl FnOnce(&Self) -> Result<T, RpcError> + Send,
    ) -> Result<T, RpcError> {
        let latency = self.gateway.settings().latency;
        let mut destroyed = self.destroyed.subscribe();
        tokio::select! {
            () = wait_until_destroyed(&mut destroyed) => {
                return Err(RpcError::CommunicatorDestroyed);
            }
            () = delay(latency) => {}
        }
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }
        if self.connection.is_closed() {
            return Err(RpcError::ConnectionLost);
        }
        op(self)
    }

    fn check_router(&self, identity: &Identity) -> Result<(), RpcError> {
        if *identity == self.gateway.settings().router_identity {
            Ok(())
        } else {
            Err(RpcError::ObjectNotExist(identity.clone()))
        }
    }

    fn open_session(
        &self,
        password: Option<(&str, &str)>,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError> {
        let settings = self.gateway.settings();
        match password {
            Some((username, password)) => match settings.accounts.get(username) {
                Some(expected) if expected == password => {}
                Some(_) => return Err(RpcError::PermissionDenied("invalid password".into())),
                None => {
                    return Err(RpcError::PermissionDenied(format!(
                        "unknown user `{username}`"
                    )));
                }
            },
            None if !settings.secure_clients => {
                return Err(RpcError::PermissionDenied(
                    "client certificate not accepted".into(),
                ));
            }
            None => {}
        }
        if let Some(reason) = settings.session_rejection {
            return Err(RpcError::CannotCreateSession(reason));
        }

        let identity = Identity::new(Uuid::new_v4().to_string(), "session");
        {
            let mut session = lock(&self.session);
            if session.is_some() {
                return Err(RpcError::CannotCreateSession(
                    "session already exists for this connection".into(),
                ));
            }
            *session = Some(identity.clone());
        }
        self.gateway.inner.sessions_created.fetch_add(1, Ordering::SeqCst);
        *lock(&self.gateway.inner.last_context) = Some(context.clone());
        Ok(Arc::new(MemorySession { identity }))
    }

    fn close_session(&self) -> Result<(), RpcError> {
        if let Some(error) = self.gateway.settings().destroy_session_error {
            return Err(error);
        }
        lock(&self.session)
            .take()
            .map(|_| self.gateway.session_ended())
            .ok_or(RpcError::SessionNotExist)
    }
}

#[async_trait]
impl Communicator for MemoryCommunicator {
    fn router_finder(&self, proxy: &str) -> Result<Arc<dyn RouterFinderPrx>, RpcError> {
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }
        let proxy: ProxyString = proxy.parse()?;
        Ok(Arc::new(MemoryRouterFinder {
            communicator: Weak::clone(&self.this),
            identity: proxy.identity,
        }))
    }

    fn default_router(&self) -> Option<Arc<dyn RouterPrx>> {
        lock(&self.default_router).clone()
    }

    fn set_default_router(&self, router: Arc<dyn RouterPrx>) {
        *lock(&self.default_router) = Some(router);
    }

    async fn create_object_adapter_with_router(
        &self,
        name: &str,
        router: Arc<dyn RouterPrx>,
    ) -> Result<Arc<dyn ObjectAdapter>, RpcError> {
        let name = if name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        self.invoke(|c| {
            c.check_router(&router.identity())?;
            let adapter = Arc::new(MemoryObjectAdapter::new(name, router.identity()));
            lock(&c.adapters).push(Arc::clone(&adapter));
            Ok(adapter as Arc<dyn ObjectAdapter>)
        })
        .await
    }

    async fn destroy(&self) {
        if self.destroyed.send_replace(true) {
            let mut torn_down = self.torn_down.subscribe();
            let _ = torn_down.wait_for(|done| *done).await;
            return;
        }
        // In-flight invocations fail before the connection closes.
        tokio::task::yield_now().await;

        let adapters: Vec<_> = lock(&self.adapters).drain(..).collect();
        for adapter in adapters {
            adapter.destroy();
        }
        *lock(&self.default_router) = None;
        // The gateway ends the session when its connection goes away.
        if lock(&self.session).take().is_some() {
            self.gateway.session_ended();
        }
        self.connection.close();
        self.gateway.inner.live_runtimes.fetch_sub(1, Ordering::SeqCst);
        self.torn_down.send_replace(true);
        tracing::debug!(connection = %self.connection.description, "Memory runtime destroyed");
    }

    fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }
}

struct MemoryRouterFinder {
    communicator: Weak<MemoryCommunicator>,
    identity: Identity,
}

#[async_trait]
impl RouterFinderPrx for MemoryRouterFinder {
    async fn get_router(&self) -> Result<Arc<dyn RouterPrx>, RpcError> {
        let communicator = self
            .communicator
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)?;
        communicator
            .invoke(|c| {
                let settings = c.gateway.settings();
                if !settings.finder_available || self.identity != Identity::router_finder() {
                    return Err(RpcError::ObjectNotExist(self.identity.clone()));
                }
                Ok(MemoryRouter::new(
                    Weak::clone(&self.communicator),
                    settings.router_identity,
                ))
            })
            .await
    }

    fn router_with_identity(&self, identity: Identity) -> Arc<dyn RouterPrx> {
        MemoryRouter::new(Weak::clone(&self.communicator), identity)
    }
}

struct MemoryRouter {
    communicator: Weak<MemoryCommunicator>,
    identity: Identity,
}

impl MemoryRouter {
    fn new(communicator: Weak<MemoryCommunicator>, identity: Identity) -> Arc<dyn RouterPrx> {
        Arc::new(Self {
            communicator,
            identity,
        })
    }

    async fn invoke<T>(
        &self,
        op: impl FnOnce(&MemoryCommunicator) -> Result<T, RpcError> + Send,
    ) -> Result<T, RpcError> {
        let communicator = self
            .communicator
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)?;
        communicator
            .invoke(|c| {
                c.check_router(&self.identity)?;
                op(c)
            })
            .await
    }
}

#[async_trait]
impl RouterPrx for MemoryRouter {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn cached_connection(&self) -> Option<Arc<dyn Connection>> {
        let communicator = self.communicator.upgrade()?;
        if communicator.is_destroyed() {
            return None;
        }
        Some(communicator.connection() as Arc<dyn Connection>)
    }

    async fn create_session(
        &self,
        username: &str,
        password: &str,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError> {
        self.invoke(|c| c.open_session(Some((username, password)), context))
            .await
    }

    async fn create_session_from_secure_connection(
        &self,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError> {
        self.invoke(|c| c.open_session(None, context)).await
    }

    async fn destroy_session(&self) -> Result<(), RpcError> {
        self.invoke(MemoryCommunicator::close_session).await
    }

    async fn category_for_client(&self) -> Result<String, RpcError> {
        self.invoke(|c| Ok(c.category.clone())).await
    }

    async fn session_timeout(&self) -> Result<i64, RpcError> {
        self.invoke(|c| Ok(c.gateway.settings().session_timeout))
            .await
    }

    async fn keep_alive_timeout(&self) -> Result<i32, RpcError> {
        self.invoke(|c| {
            let settings = c.gateway.settings();
            if let Some(hook) = &settings.keep_alive_hook {
                hook();
            }
            settings
                .keep_alive_timeout
                .ok_or_else(|| RpcError::OperationNotExist("getKeepAliveTimeout".into()))
        })
        .await
    }
}

struct MemorySession {
    identity: Identity,
}

impl SessionPrx for MemorySession {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}

/// Client side of a simulated gateway connection.
pub struct MemoryConnection {
    description: String,
    keep_alive: Mutex<Option<KeepAlive>>,
    close_callback: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn new(description: String) -> Self {
        Self {
            description,
            keep_alive: Mutex::new(None),
            close_callback: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Keep-alive settings applied by the client.
    #[must_use]
    pub fn keep_alive(&self) -> Option<KeepAlive> {
        *lock(&self.keep_alive)
    }

    #[must_use]
    pub fn has_close_callback(&self) -> bool {
        lock(&self.close_callback).is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection, running the close callback once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = lock(&self.close_callback).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Connection for MemoryConnection {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn set_keep_alive(&self, keep_alive: KeepAlive) {
        *lock(&self.keep_alive) = Some(keep_alive);
    }

    /// Runs `callback` right away if the connection is already closed.
    fn set_close_callback(&self, callback: CloseCallback) {
        let mut slot = lock(&self.close_callback);
        if self.is_closed() {
            drop(slot);
            callback();
        } else {
            *slot = Some(callback);
        }
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Object adapter whose proxies route through the gateway router.
pub struct MemoryObjectAdapter {
    name: String,
    router: Identity,
    servants: Mutex<HashMap<Identity, Arc<dyn Servant>>>,
    active: AtomicBool,
    destroyed: AtomicBool,
}

impl MemoryObjectAdapter {
    fn new(name: String, router: Identity) -> Self {
        Self {
            name,
            router,
            servants: Mutex::new(HashMap::new()),
            active: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn servant_count(&self) -> usize {
        lock(&self.servants).len()
    }

    fn check_live(&self) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(RpcError::AdapterDeactivated(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectAdapter for MemoryObjectAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn activate(&self) -> Result<(), RpcError> {
        self.check_live()?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx, RpcError> {
        self.check_live()?;
        match lock(&self.servants).entry(identity.clone()) {
            Entry::Occupied(_) => Err(RpcError::AlreadyRegistered(identity)),
            Entry::Vacant(slot) => {
                slot.insert(servant);
                Ok(ObjectPrx::new(identity).with_router(self.router.clone()))
            }
        }
    }

    fn remove(&self, identity: &Identity) -> Result<Arc<dyn Servant>, RpcError> {
        self.check_live()?;
        lock(&self.servants)
            .remove(identity)
            .ok_or_else(|| RpcError::ObjectNotExist(identity.clone()))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        lock(&self.servants).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    struct Echo;

    impl Servant for Echo {
        fn interface_id(&self) -> &str {
            "::Demo::Echo"
        }
    }

    async fn runtime(gateway: &MemoryGateway) -> Arc<dyn Communicator> {
        assert_ok!(gateway.factory().initialize(&RuntimeConfig::new()).await)
    }

    async fn router(runtime: &Arc<dyn Communicator>) -> Arc<dyn RouterPrx> {
        let finder = assert_ok!(
            runtime.router_finder("\"Runtime/RouterFinder\":tcp -p 4063 -h \"localhost\"")
        );
        assert_ok!(finder.get_router().await)
    }

    #[tokio::test]
    async fn test_password_session_lifecycle() {
        let gateway = MemoryGateway::new().with_account("alice", "secret");
        let runtime = runtime(&gateway).await;
        let router = router(&runtime).await;

        let denied = router.create_session("alice", "wrong", &Context::new()).await;
        assert!(denied.err().is_some_and(|e| e.is_credential_failure()));

        let mut context = Context::new();
        context.insert("client".into(), "test".into());
        assert_ok!(router.create_session("alice", "secret", &context).await);
        assert_eq!(gateway.active_sessions(), 1);
        assert_eq!(gateway.last_context(), Some(context));

        let second = router.create_session("alice", "secret", &Context::new()).await;
        assert!(matches!(
            second.err(),
            Some(RpcError::CannotCreateSession(_))
        ));

        assert_ok!(router.destroy_session().await);
        assert_eq!(
            assert_err!(router.destroy_session().await),
            RpcError::SessionNotExist
        );
        assert_eq!(gateway.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_destroy_fails_inflight_invocation() {
        let gateway = MemoryGateway::new().with_latency(Duration::from_secs(30));
        let runtime = MemoryCommunicator::new(
            gateway.clone(),
            &RuntimeConfig::new(),
            &gateway.settings(),
        )
        .unwrap();
        let router = MemoryRouter::new(Arc::downgrade(&runtime), Identity::default_router());

        let call = tokio::spawn(async move { router.category_for_client().await });
        tokio::task::yield_now().await;
        runtime.destroy().await;

        assert_eq!(call.await.unwrap(), Err(RpcError::CommunicatorDestroyed));
        assert_eq!(gateway.live_runtimes(), 0);
        assert!(runtime.connection().is_closed());
    }

    #[tokio::test]
    async fn test_second_destroy_waits_for_teardown() {
        let gateway = MemoryGateway::new();
        let runtime = runtime(&gateway).await;

        let first = tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.destroy().await }
        });
        while !runtime.is_destroyed() {
            tokio::task::yield_now().await;
        }
        runtime.destroy().await;
        assert_eq!(gateway.live_runtimes(), 0);
        assert!(gateway.connections().is_empty());
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_invocations() {
        let gateway = MemoryGateway::new();
        let runtime = runtime(&gateway).await;
        let router = router(&runtime).await;

        assert_eq!(gateway.drop_connections(), 1);
        assert!(gateway.connections().is_empty());
        assert_eq!(
            assert_err!(router.session_timeout().await),
            RpcError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_unavailable_finder_reports_missing_object() {
        let gateway = MemoryGateway::new().with_router_finder(false);
        let runtime = runtime(&gateway).await;
        let finder = assert_ok!(
            runtime.router_finder("\"Runtime/RouterFinder\":tcp -p 4063 -h \"localhost\"")
        );
        assert!(matches!(
            finder.get_router().await.err(),
            Some(RpcError::ObjectNotExist(_))
        ));

        let fallback = finder.router_with_identity(Identity::default_router());
        assert_ok!(fallback.category_for_client().await);
        let wrong = finder.router_with_identity(Identity::new("router", "Other"));
        assert!(matches!(
            assert_err!(wrong.category_for_client().await),
            RpcError::ObjectNotExist(_)
        ));
    }

    #[tokio::test]
    async fn test_static_default_router_from_config() {
        let gateway = MemoryGateway::new();
        let config = RuntimeConfig::new().with_property(
            RuntimeConfig::DEFAULT_ROUTER,
            "\"Gateway/router\":tcp -p 4063 -h \"localhost\"",
        );
        let runtime = assert_ok!(gateway.factory().initialize(&config).await);
        let router = runtime.default_router().unwrap();
        assert_eq!(router.identity(), Identity::default_router());
    }

    #[tokio::test]
    async fn test_keep_alive_query_unsupported() {
        let gateway = MemoryGateway::new().with_keep_alive_timeout(None);
        let runtime = runtime(&gateway).await;
        let router = router(&runtime).await;
        let error = assert_err!(router.keep_alive_timeout().await);
        assert!(error.is_unsupported());
    }

    #[test]
    fn test_close_callback_runs_once() {
        let connection = MemoryConnection::new("test".into());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        connection.set_close_callback(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        connection.close();
        connection.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Late registration on a closed connection fires immediately.
        let c = Arc::clone(&count);
        connection.set_close_callback(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!connection.has_close_callback());
    }

    #[tokio::test]
    async fn test_adapter_registration() {
        let adapter = MemoryObjectAdapter::new("callbacks".into(), Identity::default_router());
        assert_ok!(adapter.activate().await);
        assert!(adapter.is_active());

        let identity = Identity::new("echo", "client-1");
        let proxy = assert_ok!(adapter.add(Arc::new(Echo), identity.clone()));
        assert_eq!(proxy.router(), Some(&Identity::default_router()));
        assert_eq!(
            assert_err!(adapter.add(Arc::new(Echo), identity.clone())),
            RpcError::AlreadyRegistered(identity.clone())
        );

        adapter.destroy();
        assert_eq!(adapter.servant_count(), 0);
        assert!(matches!(
            adapter.remove(&identity).err(),
            Some(RpcError::AdapterDeactivated(_))
        ));
    }
}
