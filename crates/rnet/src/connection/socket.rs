//! Socket-level helpers over a shared `TcpStream`.
//!
//! Reads and writes go through `&TcpStream` readiness + `try_*` calls so the
//! receive loop, writers and the liveness probe can share one stream without
//! splitting it.

use std::io;
use std::net::Shutdown;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;

use rnet_core::KeepAliveConfig;

/// How long the liveness probe waits for the socket to become readable.
///
/// On a quiet socket the probe always runs to this limit, so every probed
/// read on an idle connection starts up to this much later.
pub(crate) const LIVENESS_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Reads whatever is available, waiting for readiness first.
pub(crate) async fn read_some(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Writes the whole buffer.
pub(crate) async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = buf.get(n..).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Best-effort check that the remote end is still there.
///
/// | readable | peek | live |
/// |----------|------|------|
/// | no       | -    | yes  |
/// | yes      | 0    | no   |
/// | yes      | >0   | yes  |
///
/// Any error counts as not live. The answer is stale the moment it is
/// returned, so it only ever serves to skip doomed reads and writes.
pub(crate) async fn probe(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match timeout(LIVENESS_POLL_TIMEOUT, stream.peek(&mut byte)).await {
        Err(_) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
    }
}

/// Shuts both directions down, waking any pending read or write.
pub(crate) fn shutdown(stream: &TcpStream) -> io::Result<()> {
    match SockRef::from(stream).shutdown(Shutdown::Both) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

pub(crate) fn keepalive_enabled(stream: &TcpStream) -> io::Result<bool> {
    SockRef::from(stream).keepalive()
}

/// Writes all keep-alive settings in one go.
///
/// Most platforms only accept interval and time together with the enable
/// flag, so every change rewrites the full set.
pub(crate) fn apply_keepalive(stream: &TcpStream, config: &KeepAliveConfig) -> io::Result<()> {
    let sock = SockRef::from(stream);
    if config.enabled {
        let params = TcpKeepalive::new()
            .with_time(config.time)
            .with_interval(config.interval);
        sock.set_tcp_keepalive(&params)
    } else {
        sock.set_keepalive(false)
    }
}
