//! End-to-end signaling tests: a real server on a loopback port, driven by
//! raw WebSocket clients speaking the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use webrtc_conference::protocol::ServerFrame;
use webrtc_conference::server::auth::NoAuth;
use webrtc_conference::server::registry::RoomRegistry;
use webrtc_conference::server::router::MessageRouter;
use webrtc_conference::server::store::NullStore;
use webrtc_conference::server::SignalingServer;

async fn start_server() -> SocketAddr {
    let registry = Arc::new(RoomRegistry::new());
    let router = Arc::new(MessageRouter::new(registry, Arc::new(NullStore)));
    let server = SignalingServer::bind("127.0.0.1:0", router, Arc::new(NoAuth))
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());
    addr
}

struct WireClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WireClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}", addr))
            .await
            .expect("client connect");
        Self { ws }
    }

    async fn send(&mut self, frame: serde_json::Value) {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> ServerFrame {
        loop {
            let msg = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("read");
            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("valid server frame")
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    async fn join(&mut self, room: &str, name: &str) -> (String, Vec<String>) {
        self.send(json!({"type": "join", "roomId": room, "displayName": name}))
            .await;
        match self.recv().await {
            ServerFrame::Joined {
                participant_id,
                participants,
                ..
            } => (
                participant_id,
                participants.into_iter().map(|p| p.participant_id).collect(),
            ),
            other => panic!("expected joined, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn two_participants_negotiate_through_the_server() {
    let addr = start_server().await;
    let mut a = WireClient::connect(addr).await;
    let mut b = WireClient::connect(addr).await;

    let (a_id, a_saw) = a.join("meet", "Alice").await;
    assert!(a_saw.is_empty());

    let (b_id, b_saw) = b.join("meet", "Bob").await;
    assert_eq!(b_saw, vec![a_id.clone()]);

    // First joiner hears about the newcomer.
    match a.recv().await {
        ServerFrame::UserJoined {
            participant_id,
            display_name,
        } => {
            assert_eq!(participant_id, b_id);
            assert_eq!(display_name, "Bob");
        }
        other => panic!("expected user-joined, got {:?}", other),
    }
    match a.recv().await {
        ServerFrame::PresenceUpdate { action, .. } => assert_eq!(action, "joined"),
        other => panic!("expected presence-update, got {:?}", other),
    }

    // Later joiner initiates: offer goes B -> A, relabeled with B's id.
    b.send(json!({
        "type": "offer",
        "targetId": a_id,
        "offer": {"type": "offer", "sdp": "v=0 b"},
    }))
    .await;
    match a.recv().await {
        ServerFrame::Offer { from, offer } => {
            assert_eq!(from, b_id);
            assert_eq!(offer["sdp"], "v=0 b");
        }
        other => panic!("expected offer, got {:?}", other),
    }

    a.send(json!({
        "type": "answer",
        "targetId": b_id,
        "answer": {"type": "answer", "sdp": "v=0 a"},
    }))
    .await;
    match b.recv().await {
        ServerFrame::Answer { from, answer } => {
            assert_eq!(from, a_id);
            assert_eq!(answer["sdp"], "v=0 a");
        }
        other => panic!("expected answer, got {:?}", other),
    }

    b.send(json!({
        "type": "ice-candidate",
        "targetId": a_id,
        "candidate": {"candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host"},
    }))
    .await;
    match a.recv().await {
        ServerFrame::IceCandidate { from, .. } => assert_eq!(from, b_id),
        other => panic!("expected ice-candidate, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_and_toggles_fan_out_to_the_room() {
    let addr = start_server().await;
    let mut a = WireClient::connect(addr).await;
    let mut b = WireClient::connect(addr).await;

    let (a_id, _) = a.join("meet", "Alice").await;
    b.join("meet", "Bob").await;
    a.recv().await; // user-joined
    a.recv().await; // presence-update

    a.send(json!({"type": "chat", "message": "hello"})).await;
    match b.recv().await {
        ServerFrame::Chat {
            participant_id,
            display_name,
            message,
            timestamp,
        } => {
            assert_eq!(participant_id, a_id);
            assert_eq!(display_name, "Alice");
            assert_eq!(message, "hello");
            // Server-stamped, not client-supplied.
            let age = chrono::Utc::now() - timestamp;
            assert!(age.num_seconds() < 5);
        }
        other => panic!("expected chat, got {:?}", other),
    }

    a.send(json!({"type": "toggle-audio", "enabled": false}))
        .await;
    match b.recv().await {
        ServerFrame::AudioToggled {
            participant_id,
            enabled,
        } => {
            assert_eq!(participant_id, a_id);
            assert!(!enabled);
        }
        other => panic!("expected audio-toggled, got {:?}", other),
    }
}

#[tokio::test]
async fn leave_notifies_the_room_exactly_once() {
    let addr = start_server().await;
    let mut a = WireClient::connect(addr).await;
    let mut b = WireClient::connect(addr).await;

    a.join("meet", "Alice").await;
    let (b_id, _) = b.join("meet", "Bob").await;
    a.recv().await;
    a.recv().await;

    // Explicit leave followed by the socket closing.
    b.send(json!({"type": "leave"})).await;
    b.ws.close(None).await.expect("close");

    match a.recv().await {
        ServerFrame::UserLeft { participant_id } => assert_eq!(participant_id, b_id),
        other => panic!("expected user-left, got {:?}", other),
    }

    // Still exactly one user-left: the next frame A sees is something else
    // entirely (a fresh join).
    let mut c = WireClient::connect(addr).await;
    let (c_id, _) = c.join("meet", "Cara").await;
    match a.recv().await {
        ServerFrame::UserJoined { participant_id, .. } => assert_eq!(participant_id, c_id),
        other => panic!("expected user-joined, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_frame_gets_an_error_without_dropping_the_connection() {
    let addr = start_server().await;
    let mut a = WireClient::connect(addr).await;
    a.join("meet", "Alice").await;

    a.ws.send(Message::Text("{not json".to_owned()))
        .await
        .expect("send");
    match a.recv().await {
        ServerFrame::Error { message } => assert!(message.contains("invalid JSON")),
        other => panic!("expected error, got {:?}", other),
    }

    // Known-kind frame with missing fields is also malformed.
    a.send(json!({"type": "offer"})).await;
    match a.recv().await {
        ServerFrame::Error { .. } => {}
        other => panic!("expected error, got {:?}", other),
    }

    // Unknown kinds are ignored, and the connection still works.
    a.send(json!({"type": "reaction", "emoji": "wave"})).await;
    let mut b = WireClient::connect(addr).await;
    b.join("meet", "Bob").await;
    match a.recv().await {
        ServerFrame::UserJoined { display_name, .. } => assert_eq!(display_name, "Bob"),
        other => panic!("expected user-joined, got {:?}", other),
    }
}

#[tokio::test]
async fn relay_to_a_gone_target_is_dropped() {
    let addr = start_server().await;
    let mut a = WireClient::connect(addr).await;
    a.join("meet", "Alice").await;

    a.send(json!({
        "type": "offer",
        "targetId": "nobody-home",
        "offer": {"type": "offer", "sdp": "v=0"},
    }))
    .await;

    // No error frame comes back; the connection keeps working.
    let mut b = WireClient::connect(addr).await;
    b.join("meet", "Bob").await;
    match a.recv().await {
        ServerFrame::UserJoined { display_name, .. } => assert_eq!(display_name, "Bob"),
        other => panic!("expected user-joined, got {:?}", other),
    }
}
