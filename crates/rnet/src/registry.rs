//! Concurrent registry of live connections.
//!
//! The server inserts from its accept loop and removes from per-connection
//! status callbacks, so both paths run concurrently with each other and with
//! callers reading [`ClientRegistry::snapshot`]. Storage is a sharded
//! `DashMap`: inserts and removals touch a single shard, and unrelated
//! connections never contend on one registry-wide lock.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Collisions are reported through the return value, never by overwriting

use std::collections::HashMap;
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use rnet_core::ConnectionId;

/// Map from [`ConnectionId`] to a connection handle.
///
/// Generic over the handle so it can be exercised without sockets; the
/// server uses `ClientRegistry<Connection>`.
pub struct ClientRegistry<C> {
    clients: DashMap<ConnectionId, C>,
}

impl<C: Clone> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Inserts a handle unless the id is already present.
    ///
    /// Returns `false` on collision; the existing entry is left untouched.
    pub fn try_add(&self, id: ConnectionId, client: C) -> bool {
        match self.clients.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(client);
                true
            }
        }
    }

    /// Removes a handle. Returns whether it was present.
    pub fn try_remove(&self, id: &ConnectionId) -> bool {
        self.clients.remove(id).is_some()
    }

    /// Copies the current entries into an owned map.
    ///
    /// The copy is safe to iterate while the registry keeps changing.
    pub fn snapshot(&self) -> HashMap<ConnectionId, C> {
        self.clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.clients.clear();
    }
}

impl<C: Clone> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for ClientRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("count", &self.clients.len())
            .finish()
    }
}
