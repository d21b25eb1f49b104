//! Builds session helpers from gateway connection settings.

use std::{fmt, sync::Arc, time::Duration};

use gateway_session_core::{Context, Identity, ProxyString, RuntimeConfig, RuntimeFactory};
use serde::{Deserialize, Serialize};

use crate::{
    Credentials, ProcessShutdown, SessionCallback, SessionError, SessionHelper, ShutdownHooks,
};

/// Transport used to reach the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ssl => "ssl",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    #[must_use]
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Ssl | Self::Wss)
    }

    /// Well-known gateway port for this transport.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        if self.is_secure() { 4064 } else { 4063 }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to reach the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub router_host: String,
    /// Gateway port; the protocol's well-known port when unset or zero.
    pub port: Option<u16>,
    pub protocol: Protocol,
    /// Connection timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Router identity to use directly instead of querying the router
    /// finder.
    pub router_identity: Option<Identity>,
    /// Request context sent with the create-session call.
    pub context: Context,
    /// Create an object adapter for callback objects.
    pub use_callbacks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            router_host: "localhost".to_string(),
            port: None,
            protocol: Protocol::Tcp,
            timeout_ms: Some(10_000),
            router_identity: None,
            context: Context::new(),
            use_callbacks: false,
        }
    }
}

impl GatewayConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Effective gateway port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
            .filter(|p| *p != 0)
            .unwrap_or_else(|| self.protocol.default_port())
    }

    /// Stringified proxy for `identity` at the configured gateway endpoint.
    #[must_use]
    pub fn proxy_str(&self, identity: Identity) -> String {
        let host = &self.router_host;
        ProxyString::new(identity, self.protocol.as_str(), host, self.port())
            .with_timeout(self.timeout_ms)
            .to_string()
    }

    /// Stringified proxy of the gateway's router finder.
    #[must_use]
    pub fn finder_str(&self) -> String {
        self.proxy_str(Identity::router_finder())
    }
}

/// Creates [`SessionHelper`]s that share one gateway configuration.
pub struct SessionFactoryHelper {
    factory: Arc<dyn RuntimeFactory>,
    callback: Arc<dyn SessionCallback>,
    runtime_config: RuntimeConfig,
    gateway: GatewayConfig,
    hooks: Arc<dyn ShutdownHooks>,
}

impl SessionFactoryHelper {
    #[must_use]
    pub fn new(factory: Arc<dyn RuntimeFactory>, callback: Arc<dyn SessionCallback>) -> Self {
        Self {
            factory,
            callback,
            runtime_config: RuntimeConfig::new(),
            gateway: GatewayConfig::default(),
            hooks: ProcessShutdown::global(),
        }
    }

    #[must_use]
    pub fn with_gateway_config(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Base runtime configuration; gateway settings are layered on top.
    #[must_use]
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    #[must_use]
    pub fn router_host(mut self, host: impl Into<String>) -> Self {
        self.gateway.router_host = host.into();
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.gateway.port = Some(port);
        self
    }

    #[must_use]
    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.gateway.protocol = protocol;
        self
    }

    /// Shorthand for `ssl` or `tcp`.
    #[must_use]
    pub const fn secure(self, secure: bool) -> Self {
        let protocol = if secure { Protocol::Ssl } else { Protocol::Tcp };
        self.protocol(protocol)
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.gateway.timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn router_identity(mut self, identity: Identity) -> Self {
        self.gateway.router_identity = Some(identity);
        self
    }

    #[must_use]
    pub fn connect_context(mut self, context: Context) -> Self {
        self.gateway.context = context;
        self
    }

    #[must_use]
    pub const fn use_callbacks(mut self, use_callbacks: bool) -> Self {
        self.gateway.use_callbacks = use_callbacks;
        self
    }

    #[must_use]
    pub fn shutdown_hooks(mut self, hooks: Arc<dyn ShutdownHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub const fn gateway_config(&self) -> &GatewayConfig {
        &self.gateway
    }

    #[must_use]
    pub fn finder_str(&self) -> String {
        self.gateway.finder_str()
    }

    /// Runtime configuration handed to each new helper.
    ///
    /// Properties already present in the base configuration win.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut config = self.runtime_config.clone();
        if config.property(RuntimeConfig::DEFAULT_ROUTER).is_none() {
            if let Some(identity) = &self.gateway.router_identity {
                config.set_property(
                    RuntimeConfig::DEFAULT_ROUTER,
                    self.gateway.proxy_str(identity.clone()),
                );
            }
        }
        // A retried create-session could create a second session.
        if config.property(RuntimeConfig::RETRY_INTERVALS).is_none() {
            config.set_property(RuntimeConfig::RETRY_INTERVALS, "-1");
        }
        config
    }

    /// Connect using the identity established by the secure transport.
    ///
    /// # Errors
    /// See [`connect_with`](Self::connect_with).
    pub fn connect(&self) -> Result<Arc<SessionHelper>, SessionError> {
        self.connect_with(Credentials::SecureConnection)
    }

    /// Connect with user name and password.
    ///
    /// # Errors
    /// See [`connect_with`](Self::connect_with).
    pub fn connect_with_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<SessionHelper>, SessionError> {
        self.connect_with(Credentials::password(username, password))
    }

    /// Create a helper and start connecting it.
    ///
    /// # Errors
    /// Only fails if the new helper refuses to connect, which does not
    /// happen for a fresh helper. Connect failures go to the callback.
    pub fn connect_with(
        &self,
        credentials: Credentials,
    ) -> Result<Arc<SessionHelper>, SessionError> {
        let helper = SessionHelper::with_shutdown_hooks(
            Arc::clone(&self.factory),
            Arc::clone(&self.callback),
            self.runtime_config(),
            self.finder_str(),
            self.gateway.use_callbacks,
            Arc::clone(&self.hooks),
        );
        helper.connect_with(credentials, self.gateway.context.clone())?;
        Ok(helper)
    }
}

impl fmt::Debug for SessionFactoryHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactoryHelper")
            .field("gateway", &self.gateway)
            .field("runtime_config", &self.runtime_config)
            .finish_non_exhaustive()
    }
}
