//! Errors reported by the RPC runtime.

use thiserror::Error;

use crate::Identity;

/// Failure of a runtime operation or remote invocation.
///
/// Local runtime failures and the gateway's own user exceptions share one
/// enum so that connect failures can be surfaced to the application as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
    #[error("Communicator destroyed")]
    CommunicatorDestroyed,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Operation does not exist: {0}")]
    OperationNotExist(String),
    #[error("Object does not exist: {0}")]
    ObjectNotExist(Identity),
    #[error("Invalid proxy: {0}")]
    ProxyParse(String),
    #[error("Object adapter deactivated: {0}")]
    AdapterDeactivated(String),
    #[error("Identity already registered: {0}")]
    AlreadyRegistered(Identity),
    #[error("Session does not exist")]
    SessionNotExist,
    #[error("Cannot create session: {0}")]
    CannotCreateSession(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl RpcError {
    /// The remote side does not implement the invoked operation.
    ///
    /// Older gateways answer capability queries this way, so callers treat
    /// it as "capability unsupported" rather than as a failure.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::OperationNotExist(_))
    }

    /// Outcomes that are normal when ending a session: the connection is
    /// already gone, or the gateway already dropped the session.
    #[must_use]
    pub const fn is_expected_on_destroy(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::SessionNotExist)
    }

    /// Credential rejections raised by the gateway.
    #[must_use]
    pub const fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::CannotCreateSession(_) | Self::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_is_operation_not_exist_only() {
        let unknown = RpcError::OperationNotExist("getKeepAliveTimeout".into());
        let missing = RpcError::ObjectNotExist(Identity::default_router());
        assert!(unknown.is_unsupported());
        assert!(!RpcError::ConnectionLost.is_unsupported());
        assert!(!missing.is_unsupported());
    }

    #[test]
    fn test_expected_on_destroy() {
        assert!(RpcError::ConnectionLost.is_expected_on_destroy());
        assert!(RpcError::SessionNotExist.is_expected_on_destroy());
        let missing = RpcError::ObjectNotExist(Identity::default_router());
        assert!(!missing.is_expected_on_destroy());
        assert!(!RpcError::CommunicatorDestroyed.is_expected_on_destroy());
    }

    #[test]
    fn test_display_keeps_gateway_reason() {
        let err = RpcError::PermissionDenied("bad password".into());
        assert_eq!(err.to_string(), "Permission denied: bad password");
        assert!(err.is_credential_failure());
    }
}
