//! A relay server: every accepted client is paired with its own upstream
//! connection and bytes are piped both ways.
//!
//! ```text
//!  client ──▶ Server ──(un-started)──▶ dispatcher ──▶ bridge task
//!                                                      │ connect upstream
//!                                                      │ subscribe both data streams
//!                                                      │ start both
//!                                                      ▼
//!            client data ──write──▶ upstream
//!            upstream data ──write──▶ client
//!            either side stops ──▶ partner stopped
//! ```
//!
//! A client whose upstream cannot be reached is started and immediately
//! stopped, which closes its socket and removes it from the registry.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Upstream failures are logged per client and never stop the relay

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rnet::{
    ConnectOptions, Connection, ConnectionId, ConnectionResult, LifecycleStatus, NetError,
    NetResult, Server, Subscription,
};

use crate::config::RouteConfig;

struct RelayInner {
    name: String,
    target: SocketAddr,
    server: Server,
    upstream: ConnectOptions,
    /// Cancels the dispatcher and pending bridges; present while running
    dispatcher: Mutex<Option<CancellationToken>>,
}

impl RelayInner {
    fn dispatcher(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to one relay route.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<RelayInner>,
}

impl RelayServer {
    pub fn new(route: &RouteConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                name: route.name.clone(),
                target: route.target,
                server: Server::with_options(route.listen, route.name.clone(), route.server_options()),
                upstream: route.upstream_options(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Starts listening and relaying.
    ///
    /// Returns `Ok(false)` if the relay was already running.
    ///
    /// # Errors
    ///
    /// - `NetError::NoRuntime` when called outside a Tokio runtime
    /// - `NetError::Bind` if the listen address is unavailable
    pub fn start(&self) -> NetResult<bool> {
        let inner = &self.inner;
        let mut dispatcher = inner.dispatcher();

        let runtime = Handle::try_current().map_err(|_| NetError::NoRuntime {
            what: "relay dispatcher",
        })?;

        // Subscribed first so no admission can slip past the dispatcher
        let admissions = inner.server.when_client_status_changed();
        if !inner.server.start()? {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        runtime.spawn(dispatch(
            self.clone(),
            admissions,
            cancel.clone(),
        ));
        *dispatcher = Some(cancel);

        info!(
            relay = %inner.name,
            listen = ?inner.server.local_addr(),
            target = %inner.target,
            "Relay started"
        );
        Ok(true)
    }

    /// Stops accepting and tears down every client and its upstream.
    ///
    /// Returns false if the relay was not running.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        let mut dispatcher = inner.dispatcher();
        if let Some(cancel) = dispatcher.take() {
            cancel.cancel();
        }

        let stopped = inner.server.stop();
        if stopped {
            info!(relay = %inner.name, "Relay stopped");
        }
        stopped
    }

    pub fn status(&self) -> LifecycleStatus {
        self.inner.server.status()
    }

    pub fn when_status_changed(&self) -> Subscription<LifecycleStatus> {
        self.inner.server.when_status_changed()
    }

    /// Accepted clients currently being relayed.
    pub fn connected_clients(&self) -> HashMap<ConnectionId, Connection> {
        self.inner.server.connected_clients()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn listen(&self) -> SocketAddr {
        self.inner.server.endpoint()
    }

    pub fn target(&self) -> SocketAddr {
        self.inner.target
    }

    /// The bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }
}

impl fmt::Display for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} to {}",
            self.inner.name,
            self.inner.server.endpoint(),
            self.inner.target
        )
    }
}

impl fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayServer")
            .field("name", &self.inner.name)
            .field("server", &self.inner.server)
            .field("target", &self.inner.target)
            .finish()
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Hands every newly admitted client to its own bridge task.
async fn dispatch(
    relay: RelayServer,
    mut admissions: Subscription<Connection>,
    cancel: CancellationToken,
) {
    loop {
        let client = tokio::select! {
            _ = cancel.cancelled() => break,
            next = admissions.recv() => match next {
                Some(client) => client,
                None => break,
            },
        };

        // Later events for the same client are status changes, not admissions
        if client.has_ever_started() {
            continue;
        }

        tokio::spawn(bridge(
            relay.inner.name.clone(),
            relay.inner.target,
            relay.inner.upstream.clone(),
            client,
            cancel.child_token(),
        ));
    }

    debug!(relay = %relay.inner.name, "Dispatcher ended");
}

/// Connects the upstream leg for one client and pipes until either side stops.
async fn bridge(
    relay: String,
    target: SocketAddr,
    options: ConnectOptions,
    client: Connection,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            reject(&client);
            return;
        }
        connected = Connection::connect(target, options) => connected,
    };

    let upstream = match connected {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(relay = %relay, client = %client.id(), error = %e, "Upstream unavailable, dropping client");
            reject(&client);
            return;
        }
    };

    let from_client = client.when_data_received();
    let from_upstream = upstream.when_data_received();

    if let Err(e) = upstream.start().and_then(|()| client.start()) {
        warn!(relay = %relay, client = %client.id(), error = %e, "Failed to start relay pair");
        upstream.stop();
        reject(&client);
        return;
    }

    info!(
        relay = %relay,
        client = %client.id(),
        peer = %client.peer_addr(),
        upstream = %upstream.id(),
        "Relaying"
    );

    tokio::join!(
        pipe(from_client, upstream.clone()),
        pipe(from_upstream, client.clone()),
    );

    debug!(relay = %relay, client = %client.id(), upstream = %upstream.id(), "Relay pair closed");
}

/// Forwards every read from one side to the other, then stops the other.
///
/// Writes are awaited so the last bytes from a closing side are flushed
/// before its partner is stopped.
async fn pipe(mut source: Subscription<ConnectionResult>, sink: Connection) {
    while let Some(read) = source.recv().await {
        let written = sink.write(read.data).await;
        if !written.success {
            debug!(from = %read.connection.id(), to = %sink.id(), "Relay write failed");
        }
    }
    sink.stop();
}

/// Closes a client that was never relayed.
///
/// Going through start/stop makes the server unregister it.
fn reject(client: &Connection) {
    match client.start() {
        Ok(()) => {
            client.stop();
        }
        Err(e) => debug!(client = %client.id(), error = %e, "Client already closed"),
    }
}
