//! Integration tests for the relay over loopback sockets.
//!
//! The upstream is a plain Tokio echo server; clients are raw `TcpStream`s.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use rnet::LifecycleStatus;
use rnet_relay::{start_all, ConfigError, RelayConfig, RelayError, RelayServer, RouteConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {WAIT:?}");
        sleep(POLL_INTERVAL).await;
    }
}

fn ephemeral() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Spawns an echo server and returns its address.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind(ephemeral()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind(ephemeral()).await.unwrap();
    listener.local_addr().unwrap()
}

fn started_relay(name: &str, target: SocketAddr) -> (RelayServer, SocketAddr) {
    let relay = RelayServer::new(&RouteConfig::new(name, ephemeral(), target));
    assert!(relay.start().unwrap());
    let addr = relay.local_addr().expect("relay bound");
    (relay, addr)
}

/// Reads until the peer closes; true if it closed (EOF or reset).
async fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return true,
            Ok(_) => continue,
        }
    }
}

// ============================================================================
// Relaying
// ============================================================================

#[tokio::test]
async fn test_bytes_are_relayed_both_ways() {
    let echo = spawn_echo().await;
    let (relay, addr) = started_relay("echo", echo);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello relay").await.unwrap();

    let mut buf = [0u8; 11];
    within(client.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello relay");

    eventually(|| relay.connected_clients().len() == 1).await;
    relay.stop();
}

#[tokio::test]
async fn test_each_client_gets_its_own_upstream() {
    let echo = spawn_echo().await;
    let (relay, addr) = started_relay("echo", echo);

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();

    let mut buf = [0u8; 3];
    within(second.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"two");
    within(first.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"one");

    eventually(|| relay.connected_clients().len() == 2).await;
    relay.stop();
}

#[tokio::test]
async fn test_client_disconnect_is_reaped() {
    let echo = spawn_echo().await;
    let (relay, addr) = started_relay("echo", echo);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    within(client.read_exact(&mut buf)).await.unwrap();

    drop(client);
    eventually(|| relay.connected_clients().is_empty()).await;
    relay.stop();
}

#[tokio::test]
async fn test_unreachable_upstream_drops_client() {
    let target = closed_port().await;
    let (relay, addr) = started_relay("dead", target);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(within(closed_by_peer(&mut client)).await);

    eventually(|| relay.connected_clients().is_empty()).await;
    assert_eq!(relay.status(), LifecycleStatus::Started);
    relay.stop();
}

#[tokio::test]
async fn test_stop_closes_relayed_clients() {
    let echo = spawn_echo().await;
    let (relay, addr) = started_relay("echo", echo);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    within(client.read_exact(&mut buf)).await.unwrap();

    assert!(relay.stop());
    assert!(!relay.stop());
    assert!(relay.connected_clients().is_empty());
    assert!(within(closed_by_peer(&mut client)).await);
}

#[tokio::test]
async fn test_double_start_is_noop() {
    let echo = spawn_echo().await;
    let (relay, addr) = started_relay("echo", echo);
    assert!(!relay.start().unwrap());
    assert_eq!(relay.local_addr(), Some(addr));
    relay.stop();
}

#[test]
fn test_display() {
    let route = RouteConfig::new(
        "game",
        "127.0.0.1:7777".parse().unwrap(),
        "10.0.0.5:7777".parse().unwrap(),
    );
    let relay = RelayServer::new(&route);
    assert_eq!(relay.to_string(), "game - 127.0.0.1:7777 to 10.0.0.5:7777");
    assert_eq!(relay.status(), LifecycleStatus::Stopped);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_start_all_from_config_file() {
    let echo = spawn_echo().await;
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("relay.toml");
    fs::write(
        &path,
        format!(
            r#"
            [[route]]
            name = "a"
            listen = "127.0.0.1:0"
            target = "{echo}"

            [[route]]
            name = "b"
            listen = "127.0.0.1:0"
            target = "{echo}"
            receive_timeout_ms = 2000
            "#
        ),
    )
    .unwrap();

    let config = RelayConfig::load(&path).unwrap();
    let relays = start_all(&config).unwrap();
    assert_eq!(relays.len(), 2);

    for relay in &relays {
        let mut client = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
        client.write_all(relay.name().as_bytes()).await.unwrap();
        let mut buf = [0u8; 1];
        within(client.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, relay.name().as_bytes());
    }

    for relay in &relays {
        assert!(relay.stop());
    }
}

#[tokio::test]
async fn test_start_all_rolls_back_on_failure() {
    let echo = spawn_echo().await;
    let taken = TcpListener::bind(ephemeral()).await.unwrap();
    let taken_addr = taken.local_addr().unwrap();

    let config = RelayConfig {
        routes: vec![
            RouteConfig::new("ok", ephemeral(), echo),
            RouteConfig::new("clash", taken_addr, echo),
        ],
    };

    let err = start_all(&config).unwrap_err();
    assert!(matches!(err, RelayError::Start { ref name, .. } if name == "clash"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = RelayConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
