//! TCP server: listener, accept loop and client bookkeeping.
//!
//! ```text
//! accept ─▶ Connection::from_stream ─▶ registry.try_add ─▶ track status ─▶ start
//!                                                              │
//!             when_client_status_changed() ◀── every change ───┤
//!             registry.try_remove          ◀── on Stopped ─────┘
//! ```
//!
//! Each accepted connection is registered before it is started and removed
//! from the registry once its status reaches `Stopped`, before that change
//! is re-emitted. Stopping the server closes the listening socket, then
//! force-stops and clears every registered connection. A server may be
//! started again after it stopped, on the same port.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept failures are logged, never propagated out of the accept loop

mod accept;

use accept::ListenerSlot;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rnet_core::{
    ConnectionId, KeepAliveConfig, LifecycleStatus, NetError, NetResult, RetryPolicy,
    ServerOptions,
};

use crate::broadcast::{Broadcaster, Subscription};
use crate::connection::{Connection, Settings};
use crate::lifecycle::Lifecycle;
use crate::registry::ClientRegistry;

/// State that only exists while the server is listening.
struct Listening {
    listener: Arc<ListenerSlot>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

struct ServerInner {
    endpoint: SocketAddr,
    name: String,
    lifecycle: Lifecycle,
    options: RwLock<ServerOptions>,
    registry: ClientRegistry<Connection>,
    client_events: Broadcaster<Connection>,
    listening: Mutex<Option<Listening>>,
}

impl ServerInner {
    fn listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> ServerOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers, tracks and (unless deferred) starts one accepted socket.
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, listener: &CancellationToken) {
        let options = self.options();
        let connection = match Connection::from_stream(
            stream,
            Settings::from(&options),
            options.client_keep_alive,
        ) {
            Ok(connection) => connection,
            Err(e) => {
                self.reject(peer, &e);
                return;
            }
        };

        let id = connection.id();
        if !self.registry.try_add(id, connection.clone()) {
            self.reject(peer, &NetError::RegistryCollision { id });
            connection.close_transport();
            return;
        }

        // Lost a race with stop(): the snapshot may already have been taken
        if listener.is_cancelled() {
            self.registry.try_remove(&id);
            connection.close_transport();
            return;
        }

        self.track(&connection);
        debug!(server = %self.name, connection = %id, peer = %peer, "Accepted");

        if options.client_auto_start {
            if let Err(e) = connection.start() {
                self.reject(peer, &e);
                self.registry.try_remove(&id);
                connection.close_transport();
            }
        }
    }

    /// Logs a dropped accept; usage defects at error level.
    fn reject(&self, peer: SocketAddr, e: &NetError) {
        if e.is_defect() {
            error!(server = %self.name, peer = %peer, error = %e, "Dropping accepted connection");
        } else {
            warn!(server = %self.name, peer = %peer, error = %e, "Dropping accepted connection");
        }
    }

    /// Re-emits every status change of `connection` and reaps it on `Stopped`.
    ///
    /// Runs on the connection's publishing thread, so it only touches the
    /// registry and the client event stream.
    fn track(self: &Arc<Self>, connection: &Connection) {
        let server = Arc::downgrade(self);
        let handle = connection.downgrade();
        let id = connection.id();
        let mut running = false;

        connection.observe_status(move |status| {
            let (Some(server), Some(connection)) = (server.upgrade(), handle.upgrade()) else {
                return;
            };

            match status {
                LifecycleStatus::Starting | LifecycleStatus::Started => running = true,
                LifecycleStatus::Stopped if running => {
                    server.registry.try_remove(&id);
                }
                LifecycleStatus::Stopped | LifecycleStatus::Stopping => {}
            }

            server.client_events.publish(connection);
        });
    }
}

/// Cloneable handle to a TCP server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a stopped, unnamed server with default client options.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self::with_options(endpoint, String::new(), ServerOptions::default())
    }

    pub fn with_name(endpoint: SocketAddr, name: impl Into<String>) -> Self {
        Self::with_options(endpoint, name, ServerOptions::default())
    }

    pub fn with_options(endpoint: SocketAddr, name: impl Into<String>, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                endpoint,
                name: name.into(),
                lifecycle: Lifecycle::new("Server"),
                options: RwLock::new(options),
                registry: ClientRegistry::new(),
                client_events: Broadcaster::new(),
                listening: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Binds the endpoint and starts accepting.
    ///
    /// Returns `Ok(false)` if the server was not stopped.
    ///
    /// # Errors
    ///
    /// - `NetError::Bind` if the endpoint cannot be bound
    /// - `NetError::NoRuntime` when called outside a Tokio runtime
    ///
    /// The status is back at `Stopped` after either error.
    pub fn start(&self) -> NetResult<bool> {
        let inner = &self.inner;
        inner.lifecycle.start(|| {
            let runtime = Handle::try_current().map_err(|_| NetError::NoRuntime {
                what: "server accept loop",
            })?;
            let listener = accept::bind(inner.endpoint)?;
            let local_addr = listener.local_addr()?;
            let listener = Arc::new(ListenerSlot::new(listener));
            let cancel = CancellationToken::new();

            runtime.spawn(accept::run(
                Arc::downgrade(inner),
                Arc::clone(&listener),
                cancel.clone(),
            ));
            *inner.listening() = Some(Listening {
                listener,
                cancel,
                local_addr,
            });

            info!(server = %inner.name, endpoint = %local_addr, "Listening");
            Ok(())
        })
    }

    /// Stops accepting, then stops and unregisters every client.
    ///
    /// Returns false if the server was not started.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        inner.lifecycle.stop(|| {
            if let Some(listening) = inner.listening().take() {
                listening.listener.close();
                listening.cancel.cancel();
            }

            let clients = inner.registry.snapshot();
            for connection in clients.values() {
                if !connection.stop() {
                    connection.close_transport();
                }
            }
            inner.registry.clear();

            info!(server = %inner.name, clients = clients.len(), "Stopped listening");
        })
    }

    pub fn status(&self) -> LifecycleStatus {
        self.inner.lifecycle.status()
    }

    /// Status stream; yields the current status first.
    pub fn when_status_changed(&self) -> Subscription<LifecycleStatus> {
        self.inner.lifecycle.subscribe()
    }

    /// Accepted connections, emitted once on admission and again on every
    /// status change.
    ///
    /// Hot: events from before the call are not replayed. Use
    /// [`connected_clients`](Self::connected_clients) for the current set.
    pub fn when_client_status_changed(&self) -> Subscription<Connection> {
        self.inner.client_events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------------

    /// Snapshot of the registered connections.
    pub fn connected_clients(&self) -> HashMap<ConnectionId, Connection> {
        self.inner.registry.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Options applied to connections accepted from now on.
    pub fn options(&self) -> ServerOptions {
        self.inner.options()
    }

    fn update_options<F>(&self, change: F)
    where
        F: FnOnce(&mut ServerOptions),
    {
        let mut options = self
            .inner
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        change(&mut options);
    }

    pub fn set_client_receive_timeout(&self, timeout: Duration) {
        self.update_options(|options| options.client_receive_timeout = timeout);
    }

    pub fn set_client_send_timeout(&self, timeout: Duration) {
        self.update_options(|options| options.client_send_timeout = timeout);
    }

    pub fn set_client_retry_policy(&self, policy: RetryPolicy) {
        self.update_options(|options| options.client_retry = policy);
    }

    pub fn set_client_keep_alive(&self, keep_alive: Option<KeepAliveConfig>) {
        self.update_options(|options| options.client_keep_alive = keep_alive);
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured endpoint, possibly with port 0.
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// The bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listening()
            .as_ref()
            .map(|listening| listening.local_addr)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.inner.name, self.inner.endpoint)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.name)
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .field("clients", &self.inner.registry.count())
            .finish()
    }
}
