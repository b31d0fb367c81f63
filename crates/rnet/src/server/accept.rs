//! Listener setup and the accept loop.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::Poll;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rnet_core::{NetError, NetResult};

use super::ServerInner;

/// Pending-connection queue length passed to `listen`.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds a non-blocking listener with `SO_REUSEADDR` set.
///
/// Must be called from within a Tokio runtime.
pub(super) fn bind(endpoint: SocketAddr) -> NetResult<TcpListener> {
    let bind_error = |source: io::Error| NetError::Bind { endpoint, source };

    let socket = Socket::new(
        Domain::for_address(endpoint),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&endpoint.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;

    TcpListener::from_std(socket.into()).map_err(bind_error)
}

// ============================================================================
// Listener Slot
// ============================================================================

/// Listener shared between the server and its accept loop.
///
/// The accept loop only touches the listener while polling it, so the server
/// can close the socket synchronously from `stop()` and release the port
/// before `Stopped` is published.
#[derive(Debug)]
pub(super) struct ListenerSlot {
    listener: Mutex<Option<TcpListener>>,
}

impl ListenerSlot {
    pub(super) fn new(listener: TcpListener) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the next connection; `None` once the slot is closed.
    pub(super) async fn accept(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        poll_fn(|cx| match self.lock().as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await
    }

    /// Drops the listener, closing the socket. Returns whether it was open.
    pub(super) fn close(&self) -> bool {
        self.lock().take().is_some()
    }
}

/// Accepts until `cancel` fires, the slot is closed or the server is dropped.
///
/// A failed accept is logged and the loop carries on.
pub(super) async fn run(
    server: Weak<ServerInner>,
    listener: Arc<ListenerSlot>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Some(accepted) => accepted,
                None => break,
            },
        };

        let Some(inner) = server.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, peer)) => inner.admit(stream, peer, &cancel),
            Err(e) => {
                warn!(server = %inner.name, error = %e, "Accept failed");
                drop(inner);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!("Accept loop ended");
}
