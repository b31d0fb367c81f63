//! reactive-net - event-driven TCP connections and servers
//!
//! This crate turns TCP sockets into lifecycle-aware objects whose state
//! changes and received bytes are delivered as in-process event streams:
//! - `broadcast` - hot fan-out of values to any number of subscribers
//! - `lifecycle` - the shared Start/Stop state machine
//! - `connection` - one duplex byte stream with its receive loop and write path
//! - `registry` - concurrent map of live connections
//! - `server` - listener, accept loop and connection reaping
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Server                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   accept loop   │────▶│      ClientRegistry         │   │
//! │  │  (TcpListener)  │     │  (ConnectionId → handle)    │   │
//! │  └────────┬────────┘     └──────────────▲──────────────┘   │
//! │           │                             │ remove on Stopped │
//! │           │ spawn + start               │                   │
//! │           ▼                             │                   │
//! │  ┌─────────────────┐     ┌──────────────┴──────────────┐   │
//! │  │   Connection    │────▶│ Broadcaster<LifecycleStatus>│   │
//! │  │ (receive loop)  │     │  (status fan-out)           │   │
//! │  └────────┬────────┘     └─────────────────────────────┘   │
//! │           │ read events                                     │
//! │           ▼                                                 │
//! │  ┌─────────────────────────────┐                            │
//! │  │ Broadcaster<ConnectionResult>│                           │
//! │  └─────────────────────────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Poisoned locks are recovered rather than propagated

pub mod broadcast;
pub mod connection;
pub mod lifecycle;
pub mod registry;
pub mod server;

pub use broadcast::{Broadcaster, Subscription};
pub use connection::{Connection, ConnectionResult};
pub use lifecycle::Lifecycle;
pub use registry::ClientRegistry;
pub use server::Server;

pub use rnet_core::{
    ConnectOptions, ConnectionId, ConnectionInfo, EventKind, KeepAliveConfig, LifecycleStatus,
    NetError, NetResult, RetryPolicy, ServerOptions,
};
