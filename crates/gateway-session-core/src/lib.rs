//! Runtime collaborator interfaces for gateway session management.
//!
//! This crate describes what the session lifecycle manager needs from an
//! RPC runtime, without implementing one:
//! - `RuntimeFactory` / `Communicator` - runtime instances
//! - `RouterPrx` / `RouterFinderPrx` / `SessionPrx` - gateway proxies
//! - `Connection` - keep-alive and close notification
//! - `ObjectAdapter` / `Servant` - callback endpoints
//! - `Dispatcher` - application-supplied notification executor
//! - `RuntimeConfig` - runtime initialization data

pub mod config;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod traits;

pub use config::{Context, RuntimeConfig};
pub use error::RpcError;
pub use identity::{Identity, ObjectPrx};
pub use proxy::ProxyString;
pub use traits::{
    CloseCallback, Communicator, Connection, DispatchCall, Dispatcher, Heartbeat, KeepAlive,
    ObjectAdapter, RouterFinderPrx, RouterPrx, RuntimeFactory, Servant, SessionPrx,
};
