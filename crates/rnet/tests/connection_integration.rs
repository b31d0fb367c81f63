//! Integration tests for outbound connections against a plain Tokio listener.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::future::Future;
use std::time::Duration;

use rnet::{
    ConnectOptions, Connection, KeepAliveConfig, LifecycleStatus, NetError, RetryPolicy,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

async fn within<F: Future>(future: F) -> F::Output {
    timeout(WAIT, future).await.expect("timed out")
}

/// Connects with `options` and returns the connection plus the raw peer socket.
async fn connect_pair(options: ConnectOptions) -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connection, accepted) =
        tokio::join!(Connection::connect(addr, options), listener.accept());
    (connection.unwrap(), accepted.unwrap().0)
}

async fn collect_statuses(connection: &Connection) -> Vec<LifecycleStatus> {
    let mut status = connection.when_status_changed();
    let mut seen = Vec::new();
    while let Some(s) = within(status.recv()).await {
        seen.push(s);
    }
    seen
}

#[tokio::test]
async fn test_status_sequence_for_one_run() {
    let (connection, _peer) = connect_pair(ConnectOptions::default().deferred()).await;
    let mut status = connection.when_status_changed();

    connection.start().unwrap();
    assert!(connection.stop());

    let mut seen = Vec::new();
    while let Some(s) = within(status.recv()).await {
        seen.push(s);
    }
    use LifecycleStatus::*;
    assert_eq!(seen, vec![Stopped, Starting, Started, Stopping, Stopped]);
}

#[tokio::test]
async fn test_connection_cannot_restart() {
    let (connection, _peer) = connect_pair(ConnectOptions::default()).await;
    assert_eq!(connection.status(), LifecycleStatus::Started);

    assert!(matches!(
        connection.start(),
        Err(NetError::AlreadyStarted { .. })
    ));

    assert!(connection.stop());
    assert!(!connection.stop());
    assert!(matches!(
        connection.start(),
        Err(NetError::AlreadyStarted { .. })
    ));

    // A late subscriber sees the final status and completion
    assert_eq!(collect_statuses(&connection).await, vec![LifecycleStatus::Stopped]);
}

#[tokio::test]
async fn test_receive_timeout_stops_idle_connection() {
    let options = ConnectOptions::default().with_receive_timeout(Duration::from_millis(200));
    let (connection, _peer) = connect_pair(options).await;
    let mut status = connection.when_status_changed();

    let stopped = timeout(
        Duration::from_millis(200) + Duration::from_secs(1),
        status.wait_for(|s| *s == LifecycleStatus::Stopped),
    )
    .await
    .expect("idle connection was not stopped");

    assert_eq!(stopped, Some(LifecycleStatus::Stopped));
    assert!(!connection.is_connected().await);
}

#[tokio::test]
async fn test_peer_close_stops_connection_and_completes_data() {
    let (connection, peer) = connect_pair(ConnectOptions::default()).await;
    let mut data = connection.when_data_received();

    drop(peer);

    assert!(within(data.recv()).await.is_none());
    let mut status = connection.when_status_changed();
    let last = within(status.wait_for(|s| *s == LifecycleStatus::Stopped)).await;
    assert_eq!(last, Some(LifecycleStatus::Stopped));
}

#[tokio::test]
async fn test_data_from_peer_is_delivered_in_order() {
    let (connection, mut peer) = connect_pair(ConnectOptions::default()).await;
    let mut data = connection.when_data_received();

    for chunk in [&b"alpha"[..], &b"beta"[..], &b"gamma"[..]] {
        peer.write_all(chunk).await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }

    let mut received = Vec::new();
    while received.len() < b"alphabetagamma".len() {
        let result = within(data.recv()).await.unwrap();
        assert!(result.success);
        received.extend_from_slice(&result.data);
    }
    assert_eq!(received, b"alphabetagamma");
}

#[tokio::test]
async fn test_write_reaches_peer() {
    let (connection, mut peer) = connect_pair(ConnectOptions::default()).await;

    let result = connection.write(vec![2u8, 3, 10, 8, 16]).await;
    assert!(result.success);

    let mut buf = [0u8; 5];
    within(peer.read_exact(&mut buf)).await.unwrap();
    assert_eq!(buf, [2, 3, 10, 8, 16]);
}

#[tokio::test]
async fn test_write_to_vanished_peer_eventually_fails_and_stops() {
    let options = ConnectOptions::default().deferred();
    let (connection, peer) = connect_pair(options).await;
    drop(peer);
    sleep(Duration::from_millis(50)).await;

    connection.start().unwrap();

    // The first write may still be accepted locally before the reset arrives
    let mut failed = false;
    for _ in 0..20 {
        if !connection.write(vec![0u8; 1024]).await.success {
            failed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    assert!(failed);
    assert_eq!(connection.status(), LifecycleStatus::Stopped);
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = Connection::connect(addr, ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Connect { endpoint, .. } if endpoint == addr));
}

#[tokio::test]
async fn test_keep_alive_options_on_live_connection() {
    let options = ConnectOptions::default().with_keep_alive(KeepAliveConfig {
        enabled: true,
        interval: Duration::from_secs(3),
        time: Duration::from_secs(6),
    });
    let (connection, _peer) = connect_pair(options).await;

    assert!(connection.keep_alive().unwrap());
    assert_eq!(connection.keep_alive_interval(), Duration::from_secs(3));
    assert_eq!(connection.keep_alive_time(), Duration::from_secs(6));

    connection.set_keep_alive_time(Duration::from_secs(30)).unwrap();
    assert!(connection.keep_alive().unwrap());
    assert_eq!(connection.keep_alive_time(), Duration::from_secs(30));

    connection.set_keep_alive(false).unwrap();
    assert!(!connection.keep_alive().unwrap());
}

#[tokio::test]
async fn test_retry_policy_change_applies_to_unstarted_connection() {
    let (connection, _peer) = connect_pair(ConnectOptions::default().deferred()).await;
    connection.set_retry_policy(RetryPolicy::none());
    connection.set_receive_timeout(Duration::from_millis(100));
    connection.start().unwrap();

    let mut status = connection.when_status_changed();
    within(status.wait_for(|s| *s == LifecycleStatus::Stopped))
        .await
        .unwrap();
    assert_eq!(connection.retry_policy(), RetryPolicy::none());
}
