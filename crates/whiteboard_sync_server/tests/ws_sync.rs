//! End-to-end room sync tests.
//!
//! Real WebSocket clients talk to a server bound to a random local port,
//! backed by in-memory blob storage. They cover:
//!
//! - The initial full-document frame
//! - Merging and relaying sync frames between clients
//! - Targeted delivery and opaque binary relay
//! - Keep-alives, resync requests and malformed frames
//! - Reconnecting under the same session id
//! - Eviction and persistence once the last client leaves
//!
//! ```text
//! ┌──────────┐   WebSocket   ┌─────────────────────┐   WebSocket   ┌──────────┐
//! │ Client A │ ←───────────→ │ Server + RoomActor  │ ←───────────→ │ Client B │
//! └──────────┘               │ (in-memory storage) │               └──────────┘
//!                            └─────────────────────┘
//! ```

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use whiteboard_sync::{InMemoryBlobStore, RoomRegistry, keys};
use whiteboard_sync_server::{AppState, config::Config, router};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Start a server with in-memory storage on a random available port
async fn start_test_server() -> (SocketAddr, oneshot::Sender<()>, Arc<RoomRegistry>) {
    let config = Config::default();
    let registry = Arc::new(RoomRegistry::new(
        Arc::new(InMemoryBlobStore::new()),
        config.room_settings(),
    ));
    let app = router(AppState::new(registry.clone(), &config));

    // Bind to random available port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    (addr, shutdown_tx, registry)
}

async fn connect(addr: SocketAddr, room_id: &str, session_id: &str) -> Client {
    let url = format!("ws://{}/connect/{}?sessionId={}", addr, room_id, session_id);
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws
}

/// Next JSON frame, skipping transport-level control messages.
async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended")
            .expect("WS error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

fn shape(id: &str, x: i64) -> Value {
    json!({
        "id": id,
        "typeName": "shape",
        "type": "geo",
        "x": x,
        "y": 0,
        "rotation": 0,
        "opacity": 1,
        "isLocked": false,
        "meta": {},
        "props": { "w": 100, "h": 50 }
    })
}

fn sync_frame(sender: &str, records: Value) -> Value {
    json!({ "type": "sync", "senderId": sender, "data": { "records": records } })
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_initial_frame_carries_full_document() {
    let (addr, shutdown, _registry) = start_test_server().await;

    let mut ws = connect(addr, "room-1", "alice").await;
    let initial = recv_json(&mut ws).await;

    assert_eq!(initial["type"], "sync");
    assert_eq!(initial["senderId"], "server");
    assert_eq!(initial["targetId"], "alice");
    assert_eq!(initial["documentId"], "room-1");
    assert_eq!(initial["data"]["records"], json!({}));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_clients_with_disjoint_edits_converge() {
    let (addr, shutdown, registry) = start_test_server().await;

    let mut a = connect(addr, "room-1", "a").await;
    recv_json(&mut a).await;
    let mut b = connect(addr, "room-1", "b").await;
    recv_json(&mut b).await;

    send_json(&mut a, sync_frame("a", json!({ "shape:1": shape("shape:1", 1) }))).await;
    let relayed = recv_json(&mut b).await;
    assert_eq!(relayed["senderId"], "a");
    assert!(relayed["data"]["records"]["shape:1"].is_object());

    send_json(&mut b, sync_frame("b", json!({ "shape:2": shape("shape:2", 2) }))).await;
    let relayed = recv_json(&mut a).await;
    assert_eq!(relayed["senderId"], "b");

    let handle = registry.get("room-1").await.expect("live room");
    let doc = handle.document().await.unwrap();
    assert!(doc.get("shape:1").is_some());
    assert!(doc.get("shape:2").is_some());

    // A late joiner sees both in its initial frame.
    let mut c = connect(addr, "room-1", "c").await;
    let initial = recv_json(&mut c).await;
    assert!(initial["data"]["records"]["shape:1"].is_object());
    assert!(initial["data"]["records"]["shape:2"].is_object());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_targeted_and_binary_relay() {
    let (addr, shutdown, _registry) = start_test_server().await;

    let mut a = connect(addr, "room-1", "a").await;
    recv_json(&mut a).await;
    let mut b = connect(addr, "room-1", "b").await;
    recv_json(&mut b).await;
    let mut c = connect(addr, "room-1", "c").await;
    recv_json(&mut c).await;

    let mut targeted = sync_frame("a", json!({ "shape:t": shape("shape:t", 0) }));
    targeted["targetId"] = json!("c");
    send_json(&mut a, targeted).await;
    send_json(&mut a, sync_frame("a", json!({ "shape:all": shape("shape:all", 0) }))).await;

    let first_for_c = recv_json(&mut c).await;
    assert!(first_for_c["data"]["records"]["shape:t"].is_object());

    // b never got the targeted frame; its next frame is the broadcast.
    let first_for_b = recv_json(&mut b).await;
    assert!(first_for_b["data"]["records"]["shape:all"].is_object());

    a.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let msg = tokio::time::timeout(RECV_TIMEOUT, b.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::binary(vec![1u8, 2, 3]));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_keepalive_resync_and_malformed_frames() {
    let (addr, shutdown, _registry) = start_test_server().await;

    let mut ws = connect(addr, "room-1", "alice").await;
    recv_json(&mut ws).await;

    // Dropped without closing the connection.
    ws.send(Message::text("{not json")).await.unwrap();
    send_json(&mut ws, json!({ "type": "sync", "data": 42 })).await;

    send_json(&mut ws, json!({ "type": "ping" })).await;
    assert_eq!(recv_json(&mut ws).await, json!({ "type": "pong" }));

    send_json(&mut ws, json!({ "type": "request" })).await;
    let resync = recv_json(&mut ws).await;
    assert_eq!(resync["senderId"], "server");
    assert_eq!(resync["targetId"], "alice");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_connect_requires_session_and_valid_room() {
    let (addr, shutdown, _registry) = start_test_server().await;

    let missing_session = format!("ws://{}/connect/room-1", addr);
    match connect_async(&missing_session).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }

    let bad_room = format!("ws://{}/connect/bad%20room?sessionId=a", addr);
    match connect_async(&bad_room).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_reconnect_outlives_replaced_socket() {
    let (addr, shutdown, registry) = start_test_server().await;

    let mut old = connect(addr, "room-1", "alice").await;
    recv_json(&mut old).await;
    let mut new = connect(addr, "room-1", "alice").await;
    recv_json(&mut new).await;
    let mut bob = connect(addr, "room-1", "bob").await;
    recv_json(&mut bob).await;

    // Wait until the server has torn the replaced socket down.
    let _ = old.close(None).await;
    let _ = tokio::time::timeout(RECV_TIMEOUT, async {
        while let Some(Ok(_)) = old.next().await {}
    })
    .await;

    // Relayed frames name the real sender, whatever the frame claims.
    send_json(&mut bob, sync_frame("alice", json!({ "shape:b": shape("shape:b", 3) }))).await;
    let relayed = recv_json(&mut new).await;
    assert_eq!(relayed["senderId"], "bob");
    assert_eq!(relayed["documentId"], "room-1");
    assert!(relayed["data"]["records"]["shape:b"].is_object());

    assert_eq!(registry.stats().await.active_connections, 2);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_last_disconnect_persists_and_evicts() {
    let (addr, shutdown, registry) = start_test_server().await;

    let mut ws = connect(addr, "room-1", "alice").await;
    recv_json(&mut ws).await;
    send_json(&mut ws, sync_frame("alice", json!({ "shape:a": shape("shape:a", 7) }))).await;
    send_json(&mut ws, json!({ "type": "ping" })).await;
    recv_json(&mut ws).await;
    ws.close(None).await.unwrap();

    let mut evicted = false;
    for _ in 0..100 {
        if registry.get("room-1").await.is_none() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(evicted, "room should be evicted after the last disconnect");

    let stored = registry
        .store()
        .get(&keys::room_document("room-1"))
        .await
        .unwrap()
        .expect("document persisted");
    let stored: Value = serde_json::from_slice(&stored).unwrap();
    assert_eq!(stored["records"]["shape:a"]["x"], 7);

    // A new actor cold-starts from storage.
    let mut again = connect(addr, "room-1", "bob").await;
    let initial = recv_json(&mut again).await;
    assert_eq!(initial["data"]["records"]["shape:a"]["x"], 7);

    let _ = shutdown.send(());
}
