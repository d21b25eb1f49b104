//! Credential strategies for creating a gateway session.

use std::{fmt, sync::Arc};

use gateway_session_core::{Context, RouterPrx, RpcError, SessionPrx};

/// How the client authenticates with the gateway.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Identity is established by the secure transport itself.
    SecureConnection,
    /// User name and password.
    Password { username: String, password: String },
}

impl Credentials {
    #[must_use]
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create a session on `router`.
    ///
    /// # Errors
    /// Returns the gateway's rejection (`CannotCreateSession`,
    /// `PermissionDenied`) or the invocation failure unchanged.
    pub async fn create_session(
        &self,
        router: &dyn RouterPrx,
        context: &Context,
    ) -> Result<Arc<dyn SessionPrx>, RpcError> {
        match self {
            Self::SecureConnection => router.create_session_from_secure_connection(context).await,
            Self::Password { username, password } => {
                router.create_session(username, password, context).await
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecureConnection => f.write_str("SecureConnection"),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}
