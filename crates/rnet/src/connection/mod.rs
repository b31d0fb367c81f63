//! One live TCP byte stream with its receive loop and write path.
//!
//! ```text
//!            start()                               stop()
//! Connection ───────▶ receive task ──┐      ┌──── cancel token + shutdown(Both)
//!    │                               │      │
//!    │  write() ─┐                   ▼      ▼
//!    │           ├─▶ write lock ─▶ TcpStream ◀── liveness probe (peek)
//!    │  write_without_response() ─▶ outbound queue ─▶ writer task
//!    │
//!    ├─▶ when_status_changed()  (replaying)
//!    └─▶ when_data_received()   (hot, completes on stop)
//! ```
//!
//! A connection is start-once: after it stops, its socket is shut down and a
//! further `start` fails with [`NetError::AlreadyStarted`].
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Write failures are reported through [`ConnectionResult::success`]

mod receive;
mod socket;

pub use receive::RECEIVE_BUFFER_LEN;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rnet_core::{
    ConnectOptions, ConnectionId, ConnectionInfo, EventKind, KeepAliveConfig, LifecycleStatus,
    NetError, NetResult, RetryPolicy, ServerOptions,
};

use crate::broadcast::{Broadcaster, Subscription};
use crate::lifecycle::Lifecycle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn keep_alive_error(source: std::io::Error) -> NetError {
    NetError::SocketOption {
        option: "SO_KEEPALIVE",
        source,
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Runtime-mutable receive and send settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    pub retry: RetryPolicy,
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
}

impl From<&ConnectOptions> for Settings {
    fn from(options: &ConnectOptions) -> Self {
        Self {
            retry: options.retry,
            receive_timeout: options.receive_timeout,
            send_timeout: options.send_timeout,
        }
    }
}

impl From<&ServerOptions> for Settings {
    fn from(options: &ServerOptions) -> Self {
        Self {
            retry: options.client_retry,
            receive_timeout: options.client_receive_timeout,
            send_timeout: options.client_send_timeout,
        }
    }
}

// ============================================================================
// Connection Result
// ============================================================================

/// Outcome of one read or write on a connection.
#[derive(Clone)]
pub struct ConnectionResult {
    pub connection: Connection,
    pub kind: EventKind,
    /// Bytes read, or bytes that were meant to be written
    pub data: Bytes,
    /// Always true for reads
    pub success: bool,
}

impl ConnectionResult {
    pub(crate) fn read(connection: Connection, data: Bytes) -> Self {
        Self {
            connection,
            kind: EventKind::Read,
            data,
            success: true,
        }
    }

    pub(crate) fn written(connection: Connection, data: Bytes, success: bool) -> Self {
        Self {
            connection,
            kind: EventKind::Write,
            data,
            success,
        }
    }
}

impl fmt::Debug for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResult")
            .field("connection", &self.connection.id())
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("success", &self.success)
            .finish()
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionInner {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    lifecycle: Lifecycle,
    data: Broadcaster<ConnectionResult>,
    settings: Mutex<Settings>,
    /// Last keep-alive values written to the socket
    keep_alive: Mutex<KeepAliveConfig>,
    cancel: CancellationToken,
    write_lock: tokio::sync::Mutex<()>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    /// Taken by the writer task on the first fire-and-forget write
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cloneable handle to one TCP connection.
///
/// All clones share the same socket, lifecycle and event streams. Equality
/// is by [`ConnectionId`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning handle, used by tasks and callbacks that must not keep a
/// connection alive.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Opens an outbound connection.
    ///
    /// Unless `options.auto_start` is false the connection is started before
    /// it is returned.
    ///
    /// # Errors
    ///
    /// - `NetError::Connect` if the endpoint refuses or is unreachable
    /// - `NetError::ConnectTimeout` if `options.connect_timeout` elapses
    /// - `NetError::SocketOption` if keep-alive cannot be applied
    pub async fn connect(endpoint: SocketAddr, options: ConnectOptions) -> NetResult<Self> {
        let attempt = TcpStream::connect(endpoint);
        let result = match options.connect_timeout {
            Some(limit) => timeout(limit, attempt)
                .await
                .map_err(|_| NetError::ConnectTimeout {
                    endpoint,
                    timeout: limit,
                })?,
            None => attempt.await,
        };
        let stream = result.map_err(|source| NetError::Connect { endpoint, source })?;

        let connection = Self::from_stream(stream, Settings::from(&options), options.keep_alive)?;
        info!(
            connection = %connection.id(),
            peer = %endpoint,
            local = %connection.local_addr(),
            "Connected"
        );

        if options.auto_start {
            connection.start()?;
        }
        Ok(connection)
    }

    /// Wraps an established stream in an un-started connection.
    pub(crate) fn from_stream(
        stream: TcpStream,
        settings: Settings,
        keep_alive: Option<KeepAliveConfig>,
    ) -> NetResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let current_keep_alive = KeepAliveConfig {
            enabled: socket::keepalive_enabled(&stream).unwrap_or(false),
            ..KeepAliveConfig::default()
        };
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                stream,
                peer_addr,
                local_addr,
                connected_at: Utc::now(),
                lifecycle: Lifecycle::start_once("Connection"),
                data: Broadcaster::new(),
                settings: Mutex::new(settings),
                keep_alive: Mutex::new(current_keep_alive),
                cancel: CancellationToken::new(),
                write_lock: tokio::sync::Mutex::new(()),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
            }),
        };

        if let Some(config) = keep_alive {
            connection.set_keep_alive_config(config)?;
        }
        Ok(connection)
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Starts the receive loop.
    ///
    /// # Errors
    ///
    /// - `NetError::AlreadyStarted` if this connection has been started before
    /// - `NetError::NoRuntime` when called outside a Tokio runtime; the
    ///   status rolls back to `Stopped`
    pub fn start(&self) -> NetResult<()> {
        self.inner.lifecycle.start(|| {
            let runtime = Handle::try_current().map_err(|_| NetError::NoRuntime {
                what: "connection receive loop",
            })?;
            // Subscribed before Started is published so the loop cannot miss it
            let status = self.inner.lifecycle.subscribe();
            runtime.spawn(receive::run(self.clone(), status));
            Ok(())
        })?;
        Ok(())
    }

    /// Cancels the receive loop, shuts the socket down and completes the
    /// data stream.
    ///
    /// Returns false if the connection was not running.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.lifecycle.stop(|| self.close_transport());
        if stopped {
            debug!(connection = %self.inner.id, "Connection stopped");
        }
        stopped
    }

    /// Tears the socket down without a lifecycle transition.
    ///
    /// Used for connections that were never started.
    pub(crate) fn close_transport(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        if let Err(e) = socket::shutdown(&inner.stream) {
            debug!(connection = %inner.id, error = %e, "Socket shutdown failed");
        }
        inner.data.close();
    }

    pub fn status(&self) -> LifecycleStatus {
        self.inner.lifecycle.status()
    }

    pub fn has_ever_started(&self) -> bool {
        self.inner.lifecycle.has_ever_started()
    }

    /// Status stream. Yields the current status first and completes once
    /// the connection has stopped.
    pub fn when_status_changed(&self) -> Subscription<LifecycleStatus> {
        self.inner.lifecycle.subscribe()
    }

    /// Observes status changes synchronously on the publishing thread.
    ///
    /// The callback runs with the status stream locked and must not query
    /// this connection's status.
    pub(crate) fn observe_status<F>(&self, callback: F)
    where
        F: FnMut(&LifecycleStatus) + Send + 'static,
    {
        self.inner.lifecycle.observe(callback);
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Received data, one element per successful read.
    ///
    /// Hot: only reads completed after subscribing are delivered. Completes
    /// when the connection stops.
    pub fn when_data_received(&self) -> Subscription<ConnectionResult> {
        self.inner.data.subscribe()
    }

    /// Waits for the next read; `None` once the connection has stopped.
    pub async fn read(&self) -> Option<ConnectionResult> {
        self.inner.data.subscribe().recv().await
    }

    /// Writes the whole payload, bounded by the send timeout.
    ///
    /// Never fails: a timeout or I/O error yields `success == false`. After
    /// an I/O error the connection is probed and stopped if the peer is gone.
    pub async fn write(&self, data: impl Into<Bytes>) -> ConnectionResult {
        let data = data.into();
        let inner = &self.inner;

        if inner.cancel.is_cancelled() {
            return ConnectionResult::written(self.clone(), data, false);
        }

        let send_timeout = self.send_timeout();
        let outcome = {
            let _write = inner.write_lock.lock().await;
            tokio::select! {
                _ = inner.cancel.cancelled() => None,
                written = timeout(send_timeout, socket::write_all(&inner.stream, &data)) => Some(written),
            }
        };

        let success = match outcome {
            None => false,
            Some(Ok(Ok(()))) => true,
            Some(Ok(Err(e))) => {
                warn!(connection = %inner.id, error = %e, "Write failed");
                if !self.is_connected().await {
                    self.stop();
                }
                false
            }
            Some(Err(_)) => {
                warn!(connection = %inner.id, timeout = ?send_timeout, "Write timed out");
                false
            }
        };

        ConnectionResult::written(self.clone(), data, success)
    }

    /// Queues a write and returns immediately.
    ///
    /// Queued payloads are written in order by a background task. Failures
    /// are logged and still stop the connection when the peer is gone.
    pub fn write_without_response(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let inner = &self.inner;

        if inner.cancel.is_cancelled() {
            debug!(connection = %inner.id, len = data.len(), "Dropping write on stopped connection");
            return;
        }

        self.ensure_writer();
        if inner.outbound_tx.send(data).is_err() {
            debug!(connection = %inner.id, "Outbound queue closed");
        }
    }

    fn ensure_writer(&self) {
        let mut slot = lock(&self.inner.outbound_rx);
        if slot.is_none() {
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(connection = %self.inner.id, "No Tokio runtime, queued writes are pending");
                return;
            }
        };

        if let Some(rx) = slot.take() {
            runtime.spawn(drain_outbound(
                self.downgrade(),
                self.inner.cancel.clone(),
                rx,
            ));
        }
    }

    /// Best-effort liveness check.
    ///
    /// False after stop, or when the socket is readable but has nothing to
    /// read. The result is racy and only a hint.
    pub async fn is_connected(&self) -> bool {
        !self.inner.cancel.is_cancelled() && socket::probe(&self.inner.stream).await
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    fn settings(&self) -> MutexGuard<'_, Settings> {
        lock(&self.inner.settings)
    }

    pub(crate) fn receive_settings(&self) -> (RetryPolicy, Duration) {
        let settings = self.settings();
        (settings.retry, settings.receive_timeout)
    }

    pub fn receive_timeout(&self) -> Duration {
        self.settings().receive_timeout
    }

    /// Takes effect when the next receive loop starts.
    pub fn set_receive_timeout(&self, timeout: Duration) {
        self.settings().receive_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Duration {
        self.settings().send_timeout
    }

    /// Takes effect on the next write.
    pub fn set_send_timeout(&self, timeout: Duration) {
        self.settings().send_timeout = timeout;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings().retry
    }

    /// Takes effect when the next receive loop starts.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.settings().retry = policy;
    }

    /// Whether SO_KEEPALIVE is set on the socket.
    pub fn keep_alive(&self) -> NetResult<bool> {
        socket::keepalive_enabled(&self.inner.stream).map_err(keep_alive_error)
    }

    pub fn set_keep_alive(&self, enabled: bool) -> NetResult<()> {
        self.update_keep_alive(|config| config.enabled = enabled)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        lock(&self.inner.keep_alive).interval
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) -> NetResult<()> {
        self.update_keep_alive(|config| config.interval = interval)
    }

    pub fn keep_alive_time(&self) -> Duration {
        lock(&self.inner.keep_alive).time
    }

    pub fn set_keep_alive_time(&self, time: Duration) -> NetResult<()> {
        self.update_keep_alive(|config| config.time = time)
    }

    pub fn keep_alive_config(&self) -> NetResult<KeepAliveConfig> {
        let mut config = *lock(&self.inner.keep_alive);
        config.enabled = self.keep_alive()?;
        Ok(config)
    }

    pub fn set_keep_alive_config(&self, config: KeepAliveConfig) -> NetResult<()> {
        self.update_keep_alive(|current| *current = config)
    }

    /// Applies one change and rewrites enable flag, interval and time together.
    fn update_keep_alive<F>(&self, change: F) -> NetResult<()>
    where
        F: FnOnce(&mut KeepAliveConfig),
    {
        let mut current = lock(&self.inner.keep_alive);
        let mut next = *current;
        change(&mut next);
        socket::apply_keepalive(&self.inner.stream, &next).map_err(keep_alive_error)?;
        *current = next;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.inner.id,
            peer_addr: self.inner.peer_addr,
            local_addr: self.inner.local_addr,
            connected_at: self.inner.connected_at,
            status: self.status(),
        }
    }
}

/// Writer task behind [`Connection::write_without_response`].
async fn drain_outbound(
    handle: WeakConnection,
    cancel: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        let Some(connection) = handle.upgrade() else {
            break;
        };
        let result = connection.write(data).await;
        if !result.success {
            warn!(
                connection = %connection.id(),
                len = result.data.len(),
                "Queued write failed"
            );
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.info())
    }
}
