//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "TCP heartbeat link integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use failover_common::config::{PeerAddress, ServerKey};
use failover_msg::{
    ConnectionParams, HeartbeatListener, InMemoryBus, LinkConnector, Message, MessagePayload,
    MessagingError, TcpConnector, MAX_FRAME_BYTES,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const LISTENER_KEY: &str = "Jb-OGiOT8RCNNwKbPfVZMjbHVXQuyTRlu6-pspC93PY";
const WRONG_KEY: &str = "L_wdBjh--Lt6NDErbGw_aRVQaEUIw85-44iTdaGNb6A";

async fn start_listener(bus: InMemoryBus) -> (PeerAddress, broadcast::Sender<()>) {
    let key: ServerKey = LISTENER_KEY.parse().unwrap();
    let listener = HeartbeatListener::bind("127.0.0.1:0", key, bus)
        .await
        .expect("bind listener");
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(listener.serve(shutdown_rx));
    (PeerAddress::new("127.0.0.1", port), shutdown_tx)
}

fn params(address: PeerAddress, key: &str) -> ConnectionParams {
    ConnectionParams {
        address,
        identity: "simple_primary".into(),
        serverkey: key.parse().unwrap(),
    }
}

#[tokio::test]
async fn authenticated_link_delivers_heartbeats() {
    let bus = InMemoryBus::new();
    let mut inbox = bus.subscribe();
    let (address, shutdown) = start_listener(bus).await;

    let link = TcpConnector::new()
        .connect(&params(address, LISTENER_KEY))
        .await
        .expect("connect");
    assert!(link.is_connected());
    link.publish(Message::heartbeat("simple_primary"))
        .await
        .expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("message within deadline")
        .expect("bus open");
    assert_eq!(received.topic, "heartbeat/simple_primary");
    assert_eq!(received.payload, MessagePayload::Heartbeat);

    link.close().await;
    let _ = shutdown.send(());
}

#[tokio::test]
async fn wrong_key_is_rejected_by_listener() {
    let bus = InMemoryBus::new();
    let mut inbox = bus.subscribe();
    let (address, shutdown) = start_listener(bus).await;

    let link = TcpConnector::new()
        .connect(&params(address, WRONG_KEY))
        .await
        .expect("tcp connect still succeeds");
    let _ = link.publish(Message::heartbeat("simple_primary")).await;

    let outcome = tokio::time::timeout(Duration::from_millis(300), inbox.recv()).await;
    assert!(outcome.is_err(), "no message may pass a failed handshake");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn connecting_to_closed_port_is_unreachable() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let result = TcpConnector::new()
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(500))
        .connect(&params(PeerAddress::new("127.0.0.1", port), LISTENER_KEY))
        .await;
    assert!(matches!(result, Err(MessagingError::Unreachable(_))));
}

#[tokio::test]
async fn oversized_hello_is_rejected_and_listener_keeps_serving() {
    let bus = InMemoryBus::new();
    let mut inbox = bus.subscribe();
    let (address, shutdown) = start_listener(bus).await;

    let mut raw = TcpStream::connect(address.authority())
        .await
        .expect("raw connect");
    let flood = vec![b'x'; MAX_FRAME_BYTES * 4];
    let _ = raw.write_all(&flood).await;
    let _ = raw.write_all(b"\n").await;

    // The listener drops the connection instead of buffering the line.
    let mut buf = [0u8; 64];
    let closed = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf))
        .await
        .expect("listener closes the connection");
    assert!(matches!(closed, Ok(0) | Err(_)));

    let link = TcpConnector::new()
        .connect(&params(address, LISTENER_KEY))
        .await
        .expect("connect");
    link.publish(Message::heartbeat("simple_primary"))
        .await
        .expect("publish");
    let received = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("message within deadline")
        .expect("bus open");
    assert_eq!(received.topic, "heartbeat/simple_primary");

    link.close().await;
    let _ = shutdown.send(());
}
