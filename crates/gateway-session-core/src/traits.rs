//! Core traits for the RPC runtime collaborator.
//!
//! The session lifecycle manager drives a runtime exclusively through these
//! traits. Operations that reach the network are `async`; purely local ones
//! (configuration, proxy synthesis, servant registration) are not.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{Context, Identity, ObjectPrx, RpcError, RuntimeConfig};

/// Creates runtime instances.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    /// Initialize a new runtime instance.
    async fn initialize(&self, config: &RuntimeConfig) -> Result<Arc<dyn Communicator>, RpcError>;
}

/// One runtime instance. Owns every network resource, proxy and adapter it
/// creates.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Resolve the router finder from its stringified proxy.
    fn router_finder(&self, proxy: &str) -> Result<Arc<dyn RouterFinderPrx>, RpcError>;

    /// Router used for all invocations, if one is configured.
    fn default_router(&self) -> Option<Arc<dyn RouterPrx>>;

    /// Set the router used for all invocations.
    fn set_default_router(&self, router: Arc<dyn RouterPrx>);

    /// Create an object adapter that receives callbacks through `router`.
    /// Requires a round trip to the router.
    async fn create_object_adapter_with_router(
        &self,
        name: &str,
        router: Arc<dyn RouterPrx>,
    ) -> Result<Arc<dyn ObjectAdapter>, RpcError>;

    /// Destroy the instance. Invocations still in flight fail with
    /// [`RpcError::CommunicatorDestroyed`].
    ///
    /// Idempotent: a call made while another destroy is in progress returns
    /// once that destroy has finished.
    async fn destroy(&self);

    /// Whether `destroy` has been called.
    fn is_destroyed(&self) -> bool;
}

/// Proxy for the well-known router finder service.
#[async_trait]
pub trait RouterFinderPrx: Send + Sync {
    /// Ask the finder for the gateway router.
    async fn get_router(&self) -> Result<Arc<dyn RouterPrx>, RpcError>;

    /// Synthesize a router proxy at the finder's endpoint without any
    /// remote call.
    fn router_with_identity(&self, identity: Identity) -> Arc<dyn RouterPrx>;
}

/// Proxy for the gateway's session router.
#[async_trait]
pub trait RouterPrx: Send + Sync {
    fn identity(&self) -> Identity;

    /// Connection currently used by this proxy, if one is established.
    fn cached_connection(&self) -> Option<Arc<dyn Connection>>;

    /// Create a session authenticated by user name and password.
    async fn create_session(
        &self,
        username: &str,
        password: &str,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError>;

    /// Create a session authenticated by the secure transport itself.
    async fn create_session_from_secure_connection(
        &self,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError>;

    /// End the session associated with the calling connection.
    async fn destroy_session(&self) -> Result<(), RpcError>;

    /// Category to use in the identities of this client's callback objects.
    async fn category_for_client(&self) -> Result<String, RpcError>;

    /// Idle session timeout, in seconds.
    async fn session_timeout(&self) -> Result<i64, RpcError>;

    /// Keep-alive timeout, in seconds. Gateways without keep-alive support
    /// answer with [`RpcError::OperationNotExist`].
    async fn keep_alive_timeout(&self) -> Result<i32, RpcError>;
}

/// Proxy for an established gateway session.
pub trait SessionPrx: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Heartbeat policy of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Heartbeat {
    #[default]
    Off,
    OnDispatch,
    OnIdle,
    Always,
}

/// Keep-alive settings for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub timeout: Duration,
    pub heartbeat: Heartbeat,
}

impl KeepAlive {
    #[must_use]
    pub const fn new(timeout: Duration, heartbeat: Heartbeat) -> Self {
        Self { timeout, heartbeat }
    }
}

/// Invoked once when a connection closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// A transport connection owned by the runtime.
pub trait Connection: Send + Sync {
    /// Human-readable description, used for logging.
    fn description(&self) -> String;

    /// Configure keep-alive.
    fn set_keep_alive(&self, keep_alive: KeepAlive);

    /// Install the handler run when the connection closes, replacing any
    /// previous one.
    fn set_close_callback(&self, callback: CloseCallback);
}

/// Marker for objects that can be served by an [`ObjectAdapter`].
pub trait Servant: Send + Sync {
    /// Type id of the interface this servant implements.
    fn interface_id(&self) -> &str;
}

/// Local endpoint that dispatches incoming invocations to servants.
#[async_trait]
pub trait ObjectAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Start dispatching. Requires a round trip when routed.
    async fn activate(&self) -> Result<(), RpcError>;

    /// Register a servant under `identity`.
    fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx, RpcError>;

    /// Unregister the servant with `identity`.
    fn remove(&self, identity: &Identity) -> Result<Arc<dyn Servant>, RpcError>;

    /// Stop dispatching and release the adapter's resources.
    fn destroy(&self);
}

/// A unit of work handed to a [`Dispatcher`].
pub type DispatchCall = Box<dyn FnOnce() + Send>;

/// Application-supplied executor for lifecycle notifications.
///
/// Typically forwards the call to a UI event loop. The connection, when
/// present, is the one the notification concerns.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, call: DispatchCall, connection: Option<Arc<dyn Connection>>);
}

impl<F> Dispatcher for F
where
    F: Fn(DispatchCall, Option<Arc<dyn Connection>>) + Send + Sync,
{
    fn dispatch(&self, call: DispatchCall, connection: Option<Arc<dyn Connection>>) {
        self(call, connection);
    }
}
