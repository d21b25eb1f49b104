//! Session lifecycle management for clients of a session-routing gateway.
//!
//! Provides:
//! - `SessionHelper` - connect, keep alive and destroy one gateway session
//! - `SessionFactoryHelper` - build helpers from a `GatewayConfig`
//! - `SessionCallback` - lifecycle notifications for the application
//! - `ProcessShutdown` - process-exit hook registry
//! - In-memory runtime (feature: memory)

pub mod callback;
pub mod credentials;
mod dispatch;
pub mod error;
pub mod factory;
pub mod helper;
pub mod shutdown;
pub mod state;
mod task;

#[cfg(feature = "memory")]
pub mod memory;

pub use callback::SessionCallback;
pub use credentials::Credentials;
pub use error::{DispatchError, SessionError};
pub use factory::{GatewayConfig, Protocol, SessionFactoryHelper};
pub use helper::SessionHelper;
pub use shutdown::{HookError, HookId, ProcessShutdown, ShutdownHook, ShutdownHooks};
pub use state::Phase;

pub use gateway_session_core as runtime;
