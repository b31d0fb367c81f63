//! The per-connection receive loop.
//!
//! One loop runs per started connection:
//!
//! ```text
//! wait for Started
//!   └─▶ while live (probed unless the last read returned data):
//!         read (≤ receive_timeout) ─┬─ n > 0      → publish Read result
//!                                   ├─ n = 0      → peer closed, exit
//!                                   ├─ timed out  → exit
//!                                   ├─ fatal err  → exit
//!                                   └─ other err  → retry after delay, or exit when exhausted
//! stop()
//! ```
//!
//! The retry budget is taken from the connection's policy once per loop. The
//! liveness probe is skipped for the read that directly follows one that
//! returned data.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use rnet_core::{LifecycleStatus, RetryPolicy};

use super::socket;
use super::{Connection, ConnectionResult};
use crate::broadcast::Subscription;

/// Size of the reusable receive buffer (1 MiB).
pub const RECEIVE_BUFFER_LEN: usize = 1 << 20;

/// Why the receive loop ended.
#[derive(Debug)]
pub(crate) enum LoopExit {
    /// Stop was requested
    Cancelled,
    /// Liveness probe saw the remote end gone
    Disconnected,
    /// Peer closed its write side
    Closed,
    /// No data within the receive timeout
    TimedOut(Duration),
    /// Non-retryable I/O error
    Failed(io::Error),
    /// Transient errors outlasted the retry budget
    RetriesExhausted(io::Error),
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Cancelled => f.write_str("cancelled"),
            LoopExit::Disconnected => f.write_str("remote disconnected"),
            LoopExit::Closed => f.write_str("closed by peer"),
            LoopExit::TimedOut(after) => write!(f, "no data for {after:?}"),
            LoopExit::Failed(e) => write!(f, "failed: {e}"),
            LoopExit::RetriesExhausted(e) => write!(f, "retries exhausted: {e}"),
        }
    }
}

// ============================================================================
// Retry Budget
// ============================================================================

/// What to do after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadFailure {
    /// The transport is gone; end the loop
    Fatal,
    /// Wait this long and read again
    Retry(Duration),
    /// Out of retries; end the loop
    Exhausted,
}

/// Errors that mean the socket is closed or the peer unresponsive.
pub(crate) fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::InvalidInput
    )
}

/// Retry counter local to one receive-loop invocation.
///
/// A successful read refills the budget, so only consecutive failures count.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    policy: RetryPolicy,
    remaining: u32,
}

impl RetryBudget {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            remaining: policy.max_retries,
        }
    }

    pub(crate) fn on_error(&mut self, err: &io::Error) -> ReadFailure {
        if is_fatal(err) {
            return ReadFailure::Fatal;
        }
        if self.remaining == 0 {
            return ReadFailure::Exhausted;
        }
        self.remaining -= 1;
        ReadFailure::Retry(self.policy.retry_delay)
    }

    pub(crate) fn on_success(&mut self) {
        self.remaining = self.policy.max_retries;
    }

    pub(crate) fn remaining(&self) -> u32 {
        self.remaining
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Byte source drained by the receive loop.
pub(crate) trait Transport {
    /// Reads whatever is available; `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Best-effort check that the remote end is still there.
    async fn is_live(&self) -> bool;
}

impl Transport for Connection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        socket::read_some(&self.inner.stream, buf).await
    }

    async fn is_live(&self) -> bool {
        self.is_connected().await
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Task body: waits for `Started`, drains the socket, then stops the connection.
pub(super) async fn run(connection: Connection, status: Subscription<LifecycleStatus>) {
    run_with(&connection, &connection, status).await;
}

async fn run_with<T: Transport>(
    connection: &Connection,
    transport: &T,
    mut status: Subscription<LifecycleStatus>,
) {
    let started = status
        .wait_for(|s| matches!(s, LifecycleStatus::Started | LifecycleStatus::Stopped))
        .await;
    drop(status);

    if started != Some(LifecycleStatus::Started) {
        debug!(connection = %connection.id(), "Start rolled back, receive loop not run");
        return;
    }

    let exit = receive(connection, transport).await;
    match &exit {
        LoopExit::Cancelled | LoopExit::Closed | LoopExit::Disconnected => {
            debug!(connection = %connection.id(), reason = %exit, "Receive loop ended");
        }
        LoopExit::TimedOut(_) | LoopExit::Failed(_) | LoopExit::RetriesExhausted(_) => {
            warn!(connection = %connection.id(), reason = %exit, "Receive loop ended");
        }
    }

    connection.stop();
}

async fn receive<T: Transport>(connection: &Connection, transport: &T) -> LoopExit {
    let inner = &connection.inner;
    let (policy, receive_timeout) = connection.receive_settings();
    let mut budget = RetryBudget::new(policy);
    let mut buffer = vec![0u8; RECEIVE_BUFFER_LEN];
    // Cleared by a read that returned data
    let mut check_liveness = true;

    loop {
        if inner.cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }
        if check_liveness && !transport.is_live().await {
            return LoopExit::Disconnected;
        }
        check_liveness = true;

        let read = tokio::select! {
            _ = inner.cancel.cancelled() => return LoopExit::Cancelled,
            read = timeout(receive_timeout, transport.read(&mut buffer)) => read,
        };

        match read {
            Err(_) => return LoopExit::TimedOut(receive_timeout),
            Ok(Ok(0)) => return LoopExit::Closed,
            Ok(Ok(n)) => {
                budget.on_success();
                check_liveness = false;
                let payload = buffer
                    .get(..n)
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default();
                inner
                    .data
                    .publish(ConnectionResult::read(connection.clone(), payload));
            }
            Ok(Err(e)) => match budget.on_error(&e) {
                ReadFailure::Fatal => return LoopExit::Failed(e),
                ReadFailure::Exhausted => return LoopExit::RetriesExhausted(e),
                ReadFailure::Retry(delay) => {
                    warn!(
                        connection = %connection.id(),
                        error = %e,
                        retries_left = budget.remaining(),
                        "Transient receive failure, retrying"
                    );
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return LoopExit::Cancelled,
                        _ = sleep(delay) => {}
                    }
                }
            },
        }
    }
}
