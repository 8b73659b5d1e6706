//! End-to-end client tests against a local server: request/response,
//! reconnect, slot pool and timeout policy

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use frame_session::config::{ClientConfig, HubConfig, ServerConfig, TransportKind};
use frame_session::core::frame::Frame;
use frame_session::error::ProtocolError;
use frame_session::protocol::{handler, Hub};
use frame_session::{Client, Server};
use tokio::time::timeout;

const ECHO: u32 = 1;
const SILENT: u32 = 2;
const RECORD: u32 = 3;
const WAIT: Duration = Duration::from_secs(5);

async fn start_server(transport: TransportKind) -> Server {
    let hub = Hub::new(HubConfig::default());
    hub.register(ECHO, handler(|_s, f: Frame| async move { Ok(Some(f.body)) }))
        .unwrap();
    hub.register(SILENT, handler(|_s, _f| async { Ok(None) }))
        .unwrap();

    let server = Server::bind(
        ServerConfig {
            address: "127.0.0.1:0".to_string(),
            transport,
            ..ServerConfig::default()
        },
        hub,
    )
    .await
    .unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.start().await });
    server
}

fn client_config(capacity: u32, transport: TransportKind) -> ClientConfig {
    ClientConfig {
        capacity,
        transport,
        response_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should become true");
}

/// Close every server-side session and wait for the client to notice.
async fn kill_server_sessions(server: &Server, client: &Client, slot: u32) {
    for session in server.hub().all_sessions() {
        session.close();
    }
    wait_until(|| !client.is_live(slot)).await;
}

async fn echo_then_survive_reconnect(transport: TransportKind) {
    let server = start_server(transport).await;
    let client = Client::new(client_config(1, transport)).unwrap();
    let address = server.local_addr().to_string();

    let slot = client.connect(&address).await.unwrap();
    assert_eq!(slot, 1);
    let first_identity = client.identity(slot).unwrap();

    let reply = client
        .request(slot, Frame::new(ECHO, &b"hello"[..]))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));

    kill_server_sessions(&server, &client, slot).await;

    let reply = client
        .request(slot, Frame::new(ECHO, &b"again"[..]))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"again"));

    assert_eq!(client.hub().metrics().snapshot().reconnects, 1);
    assert_ne!(client.identity(slot).unwrap(), first_identity);
    wait_until(|| server.hub().metrics().snapshot().sessions_opened == 2).await;
    assert_eq!(client.pending_requests(), 0);

    server.stop();
    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_and_single_reconnect_over_websocket() {
    echo_then_survive_reconnect(TransportKind::WebSocket).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_and_single_reconnect_over_tcp() {
    echo_then_survive_reconnect(TransportKind::Tcp).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_reconnect_dials_once() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();
    kill_server_sessions(&server, &client, slot).await;

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.reconnect(slot).await })
        })
        .collect();

    let mut identities = Vec::new();
    let mut in_progress = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(identity) => identities.push(identity),
            Err(ProtocolError::ReconnectInProgress(s)) => {
                assert_eq!(s, slot);
                in_progress += 1;
            }
            Err(e) => panic!("unexpected reconnect error: {e}"),
        }
    }

    assert!(!identities.is_empty());
    assert_eq!(identities.len() + in_progress, 8);
    assert!(identities.iter().all(|id| *id == identities[0]));
    assert_eq!(client.hub().metrics().snapshot().reconnects, 1);

    wait_until(|| server.hub().metrics().snapshot().sessions_opened == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.hub().metrics().snapshot().sessions_opened, 2);

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_leaves_no_pending_entry_and_closes_session() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let result = client
        .request_with(slot, 99, Frame::empty(SILENT), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(client.pending_requests(), 0);
    assert!(!client.is_live(slot));
    assert_eq!(client.hub().metrics().snapshot().request_timeouts, 1);

    // The next request brings the slot back.
    let reply = client
        .request(slot, Frame::new(ECHO, &b"back"[..]))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"back"));

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_fails_other_requests_on_same_session() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let short = client.request_with(slot, 1, Frame::empty(SILENT), Duration::from_millis(100));
    let long = async {
        // Let the short request register first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        client
            .request_with(slot, 2, Frame::empty(SILENT), Duration::from_secs(30))
            .await
    };

    let (short, long) = timeout(WAIT, async { tokio::join!(short, long) })
        .await
        .expect("both requests should resolve well before the long timeout");
    assert!(matches!(short, Err(ProtocolError::Timeout)));
    assert!(matches!(long, Err(ProtocolError::ConnectionClosed)));
    assert_eq!(client.pending_requests(), 0);

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_key_is_rejected() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_with(slot, 5, Frame::empty(SILENT), Duration::from_millis(300))
                .await
        })
    };
    wait_until(|| client.pending_requests() == 1).await;

    let duplicate = client
        .request_with(slot, 5, Frame::empty(SILENT), Duration::from_millis(300))
        .await;
    assert!(matches!(duplicate, Err(ProtocolError::DuplicateRequest(5))));
    assert_eq!(client.pending_requests(), 1);

    assert!(matches!(waiting.await.unwrap(), Err(ProtocolError::Timeout)));
    assert_eq!(client.pending_requests(), 0);

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_and_slot_reuse() {
    let server = start_server(TransportKind::Tcp).await;
    let client = Client::new(client_config(2, TransportKind::Tcp)).unwrap();
    let address = server.local_addr().to_string();

    assert_eq!(client.connect(&address).await.unwrap(), 1);
    assert_eq!(client.connect(&address).await.unwrap(), 2);
    assert!(matches!(
        client.connect(&address).await,
        Err(ProtocolError::CapacityExceeded(2))
    ));

    client.disconnect(1).unwrap();
    assert!(!client.is_live(1));
    assert!(matches!(
        client.request(1, Frame::empty(ECHO)).await,
        Err(ProtocolError::InvalidSlot(1))
    ));

    // Disconnecting twice must not put the slot on the free list twice.
    client.disconnect(1).unwrap();
    assert_eq!(client.connect(&address).await.unwrap(), 1);
    assert!(matches!(
        client.connect(&address).await,
        Err(ProtocolError::CapacityExceeded(2))
    ));

    let reply = client.request(2, Frame::new(ECHO, &b"two"[..])).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"two"));

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dial_releases_slot() {
    let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_address = vacant.local_addr().unwrap().to_string();
    drop(vacant);

    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();

    assert!(client.connect(&dead_address).await.is_err());
    assert_eq!(
        client
            .connect(&server.local_addr().to_string())
            .await
            .unwrap(),
        1
    );

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_on_connect_sees_connect_and_reconnect() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.on_connect(move |slot| seen.lock().unwrap().push(slot));
    }

    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();
    kill_server_sessions(&server, &client, slot).await;
    client.reconnect(slot).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![slot, slot]);
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_async_is_fire_and_forget() {
    let hub = Hub::new(HubConfig::default());
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        hub.register(
            RECORD,
            handler(move |_s, _f| {
                received.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            }),
        )
        .unwrap();
    }
    let server = Server::bind(
        ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
        hub,
    )
    .await
    .unwrap();
    let running = server.clone();
    tokio::spawn(async move { running.start().await });

    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();

    for _ in 0..10 {
        client.request_async(slot, Frame::empty(RECORD)).await.unwrap();
    }
    wait_until(|| received.load(Ordering::SeqCst) == 10).await;
    assert_eq!(client.pending_requests(), 0);

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_on_different_slots_do_not_collide() {
    let server = start_server(TransportKind::WebSocket).await;
    let client = Client::new(client_config(2, TransportKind::WebSocket)).unwrap();
    let address = server.local_addr().to_string();
    let one = client.connect(&address).await.unwrap();
    let two = client.connect(&address).await.unwrap();

    let (a, b) = tokio::join!(
        client.request(one, Frame::new(ECHO, &b"one"[..])),
        client.request(two, Frame::new(ECHO, &b"two"[..])),
    );
    assert_eq!(a.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(b.unwrap(), Bytes::from_static(b"two"));

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_requests_ride_one_reconnect() {
    let hub = Hub::new(HubConfig::default());
    hub.set_fallback(handler(|_s, f: Frame| async move { Ok(Some(f.body)) }))
        .unwrap();
    let server = Server::bind(
        ServerConfig {
            address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
        hub,
    )
    .await
    .unwrap();
    let running = server.clone();
    tokio::spawn(async move { running.start().await });

    let client = Client::new(client_config(1, TransportKind::WebSocket)).unwrap();
    let slot = client
        .connect(&server.local_addr().to_string())
        .await
        .unwrap();
    kill_server_sessions(&server, &client, slot).await;

    // Distinct message types keep the default correlation keys apart.
    let requests: Vec<_> = (100..108u32)
        .map(|msg_type| {
            let client = client.clone();
            tokio::spawn(async move {
                let body = Bytes::from(msg_type.to_le_bytes().to_vec());
                let reply = client.request(slot, Frame::new(msg_type, body.clone())).await;
                (body, reply)
            })
        })
        .collect();

    for request in requests {
        let (body, reply) = request.await.unwrap();
        assert_eq!(reply.unwrap(), body);
    }
    assert_eq!(client.hub().metrics().snapshot().reconnects, 1);
    assert_eq!(client.pending_requests(), 0);

    server.stop();
}
