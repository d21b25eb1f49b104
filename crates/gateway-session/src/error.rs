//! Session helper errors.

use gateway_session_core::RpcError;
use thiserror::Error;

use crate::Phase;

/// Error raised by session helper accessors, or delivered to
/// [`SessionCallback::connect_failed`](crate::SessionCallback::connect_failed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No session exists")]
    NoSession,
    #[error("Object adapter not available, enable callbacks when creating the session helper")]
    CallbacksDisabled,
    #[error("Connect requires an idle session helper, current phase is {0}")]
    NotIdle(Phase),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Failure to run a notification through the application's dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher dropped the notification before running it")]
    Dropped,
}
