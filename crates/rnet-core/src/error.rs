//! Error types following the panic-free policy.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::ConnectionId;

/// Errors raised by connections, servers and the client registry.
///
/// Transient network failures inside the receive loop never surface here;
/// they are retried or end the connection. What does surface is either an
/// establishment failure, a socket setup failure, or a usage defect
/// (see [`NetError::is_defect`]).
#[derive(Error, Debug)]
pub enum NetError {
    /// Outbound connect failed
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connect did not complete in time
    #[error("Connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: SocketAddr, timeout: Duration },

    /// Listener could not be bound
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A socket option could not be read or written
    #[error("Socket option {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// A start-once entity was started a second time
    #[error("{kind} cannot be started again after being stopped")]
    AlreadyStarted { kind: &'static str },

    /// The registry already holds an entry under this identifier
    #[error("Connection id {id} is already registered")]
    RegistryCollision { id: ConnectionId },

    /// Start was called outside of a Tokio runtime
    #[error("No Tokio runtime available to drive {what}")]
    NoRuntime { what: &'static str },

    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Returns true for programming or environment defects, as opposed to
    /// ordinary network failures.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            NetError::AlreadyStarted { .. }
                | NetError::RegistryCollision { .. }
                | NetError::NoRuntime { .. }
        )
    }
}

/// Result type for framework operations.
pub type NetResult<T> = Result<T, NetError>;
