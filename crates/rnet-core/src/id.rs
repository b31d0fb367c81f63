//! Connection identifiers and per-connection bookkeeping.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::LifecycleStatus;

/// Source of process-unique connection identifiers.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Process-unique identifier for a connection.
///
/// Drawn from a monotonically increasing counter, so two live connections
/// can never share an id and an id is never reused for the lifetime of the
/// process. Used as the server registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps an existing raw value.
    ///
    /// Identifiers built this way bypass the allocator and may collide with
    /// allocated ones; intended for tests and diagnostics.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Connection Info
// ============================================================================

/// Point-in-time description of a connection, for logging and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub status: LifecycleStatus,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({})",
            self.id, self.local_addr, self.peer_addr, self.status
        )
    }
}
