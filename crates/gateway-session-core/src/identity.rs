//! Object identities and proxy handles.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::RpcError;

/// Identity of a remote or local object: a name within a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub category: String,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Well-known identity of the gateway router, used when the router
    /// finder cannot be queried.
    #[must_use]
    pub fn default_router() -> Self {
        Self::new("router", "Gateway")
    }

    /// Well-known identity of the router finder service.
    #[must_use]
    pub fn router_finder() -> Self {
        Self::new("RouterFinder", "Runtime")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

impl FromStr for Identity {
    type Err = RpcError;

    /// Parse `category/name` or a bare `name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, name) = s.split_once('/').unwrap_or(("", s));
        if name.is_empty() || name.contains('/') {
            return Err(RpcError::ProxyParse(format!("invalid identity `{s}`")));
        }
        Ok(Self::new(name, category))
    }
}

/// Handle to an object reachable through the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPrx {
    identity: Identity,
    router: Option<Identity>,
}

impl ObjectPrx {
    #[must_use]
    pub const fn new(identity: Identity) -> Self {
        Self {
            identity,
            router: None,
        }
    }

    /// Route invocations on this proxy through the given router.
    #[must_use]
    pub fn with_router(mut self, router: Identity) -> Self {
        self.router = Some(router);
        self
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub const fn router(&self) -> Option<&Identity> {
        self.router.as_ref()
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::default_router().to_string(), "Gateway/router");
        assert_eq!(Identity::new("alone", "").to_string(), "alone");
    }

    #[test]
    fn test_identity_parse() {
        let id: Identity = assert_ok!("Runtime/RouterFinder".parse());
        assert_eq!(id, Identity::router_finder());

        let bare: Identity = assert_ok!("callback".parse());
        assert_eq!(bare.category, "");
        assert_eq!(bare.name, "callback");

        assert_err!("cat/".parse::<Identity>());
        assert_err!("a/b/c".parse::<Identity>());
    }

    #[test]
    fn test_proxy_router() {
        let prx = ObjectPrx::new(Identity::new("abc", "client-1"))
            .with_router(Identity::default_router());
        assert_eq!(prx.identity().category, "client-1");
        assert_eq!(prx.router(), Some(&Identity::default_router()));
        assert_eq!(prx.to_string(), "client-1/abc");
    }
}
