//! reactive-net core - shared value types
//!
//! This crate provides the identifiers, lifecycle states, options and errors
//! shared between the connection framework (`rnet`) and its consumers
//! (`rnet-relay`). It has no networking code of its own.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod id;
pub mod options;
pub mod status;

// Re-exports for convenience
pub use error::{NetError, NetResult};
pub use id::{ConnectionId, ConnectionInfo};
pub use options::{
    ConnectOptions, KeepAliveConfig, RetryPolicy, ServerOptions, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_KEEP_ALIVE_TIME, DEFAULT_RECEIVE_TIMEOUT,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, DEFAULT_SEND_TIMEOUT,
};
pub use status::{EventKind, LifecycleStatus};
