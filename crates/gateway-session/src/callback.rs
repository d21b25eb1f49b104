//! Lifecycle notifications delivered to the application.

use std::sync::Arc;

use crate::{SessionError, SessionHelper};

/// Receives session lifecycle notifications.
///
/// Implement this trait to drive your UI from the session lifecycle.
/// Notifications run on the application's
/// [`Dispatcher`](gateway_session_core::Dispatcher) when one is configured,
/// otherwise on the helper's background task.
pub trait SessionCallback: Send + Sync {
    /// The runtime instance exists and no session has been created yet.
    ///
    /// The connect sequence waits for this notification to return.
    fn created_communicator(&self, _session: &Arc<SessionHelper>) {}

    /// The session is established.
    ///
    /// # Errors
    /// Return [`SessionError::NoSession`] to have the helper destroy the
    /// session right away.
    fn connected(&self, session: &Arc<SessionHelper>) -> Result<(), SessionError>;

    /// The session is gone and every runtime resource has been released.
    fn disconnected(&self, session: &Arc<SessionHelper>);

    /// The connect attempt failed. No further notification follows.
    fn connect_failed(&self, session: &Arc<SessionHelper>, error: &SessionError);
}
