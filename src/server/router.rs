//! Single dispatch point for inbound signaling frames.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{parse_client_frame, ClientFrame, ServerFrame};
use crate::server::registry::{ConnectionHandle, MediaKind, ParticipantInfo, RoomRegistry};
use crate::server::store::ConferenceStore;

/// Per-connection state owned by the connection task. `participant_id` is
/// `Some` only between a successful join and the (single) disconnect.
pub struct Session {
    pub handle: ConnectionHandle,
    pub user_id: String,
    participant_id: Option<String>,
    room_id: Option<String>,
    display_name: Option<String>,
    joined_at: Option<Instant>,
}

impl Session {
    pub fn new(handle: ConnectionHandle, user_id: String) -> Self {
        Self {
            handle,
            user_id,
            participant_id: None,
            room_id: None,
            display_name: None,
            joined_at: None,
        }
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }
}

pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ConferenceStore>,
}

impl MessageRouter {
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn ConferenceStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Handles one raw text frame from the connection. Malformed frames get
    /// an `error` frame back and the connection stays open; unknown kinds
    /// are logged and dropped.
    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        match parse_client_frame(text) {
            Ok(Some(frame)) => self.dispatch(session, frame).await,
            Ok(None) => warn!("ignoring frame of unknown kind"),
            Err(e) => {
                warn!("malformed frame: {}", e);
                session.handle.send(&ServerFrame::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, frame: ClientFrame) {
        match frame {
            ClientFrame::Join {
                room_id,
                display_name,
            } => self.handle_join(session, room_id, display_name).await,
            ClientFrame::Offer { target_id, offer } => {
                self.relay(session, &target_id, |from| ServerFrame::Offer {
                    from,
                    offer,
                })
                .await;
            }
            ClientFrame::Answer { target_id, answer } => {
                self.relay(session, &target_id, |from| ServerFrame::Answer {
                    from,
                    answer,
                })
                .await;
            }
            ClientFrame::IceCandidate {
                target_id,
                candidate,
            } => {
                self.relay(session, &target_id, |from| ServerFrame::IceCandidate {
                    from,
                    candidate,
                })
                .await;
            }
            ClientFrame::ToggleAudio { enabled } => {
                self.handle_toggle(session, MediaKind::Audio, enabled).await;
            }
            ClientFrame::ToggleVideo { enabled } => {
                self.handle_toggle(session, MediaKind::Video, enabled).await;
            }
            ClientFrame::Chat { message } => self.handle_chat(session, message).await,
            ClientFrame::Typing { is_typing } => self.handle_typing(session, is_typing).await,
            ClientFrame::Leave => self.handle_disconnect(session).await,
        }
    }

    async fn handle_join(
        &self,
        session: &mut Session,
        room_id: String,
        display_name: Option<String>,
    ) {
        if session.participant_id.is_some() {
            warn!("join on an already-joined connection, ignoring");
            return;
        }

        let participant_id = Uuid::new_v4().to_string();
        let display_name = display_name.filter(|name| !name.is_empty()).unwrap_or_else(|| {
            let prefix: String = session.user_id.chars().take(8).collect();
            format!("User {}", prefix)
        });

        match self.store.room_exists(&room_id).await {
            Ok(true) => {}
            Ok(false) => warn!("room {} not provisioned, joining in-memory", room_id),
            Err(e) => debug!("store unavailable for room lookup: {}", e),
        }
        if let Err(e) = self
            .store
            .record_join(&room_id, &participant_id, &session.user_id, &display_name)
            .await
        {
            debug!("could not persist join record: {}", e);
        }

        let info = ParticipantInfo::new(&participant_id, &session.user_id, &display_name);
        let snapshot = self
            .registry
            .join(&room_id, info, session.handle.clone())
            .await;

        session.participant_id = Some(participant_id.clone());
        session.room_id = Some(room_id.clone());
        session.display_name = Some(display_name.clone());
        session.joined_at = Some(Instant::now());

        session.handle.send(&ServerFrame::Joined {
            participant_id: participant_id.clone(),
            room_id: room_id.clone(),
            participants: snapshot,
        });

        let peers = self.registry.peers_of(&participant_id).await;
        broadcast(
            &peers,
            &ServerFrame::UserJoined {
                participant_id: participant_id.clone(),
                display_name: display_name.clone(),
            },
        );
        broadcast(
            &peers,
            &ServerFrame::PresenceUpdate {
                participant_id: participant_id.clone(),
                display_name,
                action: "joined".to_owned(),
            },
        );

        info!("participant {} joined room {}", participant_id, room_id);
    }

    /// Forwards a negotiation payload to its target, relabeled with the
    /// sender's id. A missing target means it left mid-negotiation; the
    /// frame is dropped without an error.
    async fn relay<F>(&self, session: &Session, target_id: &str, make: F)
    where
        F: FnOnce(String) -> ServerFrame,
    {
        let Some(from) = session.participant_id.clone() else {
            warn!("negotiation frame before join, dropping");
            return;
        };
        match self.registry.lookup(target_id).await {
            Some(target) => {
                target.send(&make(from));
                debug!("relayed negotiation frame to {}", target_id);
            }
            None => debug!("relay target {} is gone, dropping", target_id),
        }
    }

    async fn handle_toggle(&self, session: &Session, kind: MediaKind, enabled: bool) {
        let Some(participant_id) = session.participant_id.clone() else {
            return;
        };
        if !self.registry.set_toggle(&participant_id, kind, enabled).await {
            return;
        }
        let frame = match kind {
            MediaKind::Audio => ServerFrame::AudioToggled {
                participant_id: participant_id.clone(),
                enabled,
            },
            MediaKind::Video => ServerFrame::VideoToggled {
                participant_id: participant_id.clone(),
                enabled,
            },
        };
        broadcast(&self.registry.peers_of(&participant_id).await, &frame);
    }

    async fn handle_chat(&self, session: &Session, message: String) {
        let (Some(participant_id), Some(display_name)) =
            (session.participant_id.clone(), session.display_name.clone())
        else {
            return;
        };
        let frame = ServerFrame::Chat {
            participant_id: participant_id.clone(),
            display_name,
            message,
            timestamp: Utc::now(),
        };
        broadcast(&self.registry.peers_of(&participant_id).await, &frame);
    }

    async fn handle_typing(&self, session: &Session, is_typing: bool) {
        let (Some(participant_id), Some(display_name)) =
            (session.participant_id.clone(), session.display_name.clone())
        else {
            return;
        };
        let frame = ServerFrame::Typing {
            participant_id: participant_id.clone(),
            display_name,
            is_typing,
        };
        broadcast(&self.registry.peers_of(&participant_id).await, &frame);
    }

    /// Removes the participant and notifies the room. Runs at most once per
    /// session: a `leave` frame followed by the transport close takes the
    /// second path through the `take()` and does nothing.
    pub async fn handle_disconnect(&self, session: &mut Session) {
        let Some(participant_id) = session.participant_id.take() else {
            return;
        };
        if let Some(joined_at) = session.joined_at.take() {
            if let Err(e) = self
                .store
                .record_leave(&participant_id, joined_at.elapsed())
                .await
            {
                debug!("could not persist leave record: {}", e);
            }
        }
        if let Some(outcome) = self.registry.leave(&participant_id).await {
            broadcast(
                &outcome.peers,
                &ServerFrame::UserLeft {
                    participant_id: participant_id.clone(),
                },
            );
            info!("participant {} left room {}", participant_id, outcome.room_id);
        }
    }
}

/// Best-effort fan-out: one dead recipient never blocks the others.
fn broadcast(peers: &[ConnectionHandle], frame: &ServerFrame) {
    for peer in peers {
        if !peer.send(frame) {
            debug!("dropping frame for a closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::NullStore;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct TestPeer {
        session: Session,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Session::new(
                ConnectionHandle::new(tx),
                Uuid::new_v4().to_string(),
            );
            Self { session, rx }
        }

        fn next_frame(&mut self) -> ServerFrame {
            let msg = self.rx.try_recv().expect("expected a frame");
            match msg {
                Message::Text(text) => serde_json::from_str(&text).expect("valid server frame"),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        fn no_frames(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(RoomRegistry::new()), Arc::new(NullStore))
    }

    async fn join(router: &MessageRouter, peer: &mut TestPeer, room: &str, name: &str) -> String {
        router
            .handle_text(
                &mut peer.session,
                &format!(r#"{{"type":"join","roomId":"{}","displayName":"{}"}}"#, room, name),
            )
            .await;
        match peer.next_frame() {
            ServerFrame::Joined { participant_id, .. } => participant_id,
            other => panic!("expected joined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_scenario_first_then_second() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();

        router
            .handle_text(&mut a.session, r#"{"type":"join","roomId":"r1","displayName":"A"}"#)
            .await;
        let ServerFrame::Joined { participants, room_id, .. } = a.next_frame() else {
            panic!("expected joined");
        };
        assert_eq!(room_id, "r1");
        assert!(participants.is_empty());

        let b_id = join(&router, &mut b, "r1", "B").await;

        // A hears about B: user-joined then presence-update.
        match a.next_frame() {
            ServerFrame::UserJoined {
                participant_id,
                display_name,
            } => {
                assert_eq!(participant_id, b_id);
                assert_eq!(display_name, "B");
            }
            other => panic!("expected user-joined, got {:?}", other),
        }
        match a.next_frame() {
            ServerFrame::PresenceUpdate { action, .. } => assert_eq!(action, "joined"),
            other => panic!("expected presence-update, got {:?}", other),
        }
        // B got only the joined reply.
        assert!(b.no_frames());
    }

    #[tokio::test]
    async fn offer_relay_is_relabeled_with_sender() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        let a_id = join(&router, &mut a, "r1", "A").await;
        let b_id = join(&router, &mut b, "r1", "B").await;
        a.next_frame();
        a.next_frame(); // drain user-joined + presence-update

        router
            .handle_text(
                &mut b.session,
                &format!(
                    r#"{{"type":"offer","targetId":"{}","offer":{{"type":"offer","sdp":"v=0"}}}}"#,
                    a_id
                ),
            )
            .await;
        match a.next_frame() {
            ServerFrame::Offer { from, offer } => {
                assert_eq!(from, b_id);
                assert_eq!(offer["sdp"], "v=0");
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn relay_to_departed_target_is_dropped_silently() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        let a_id = join(&router, &mut a, "r1", "A").await;
        join(&router, &mut b, "r1", "B").await;
        router.handle_disconnect(&mut a.session).await;

        router
            .handle_text(
                &mut b.session,
                &format!(r#"{{"type":"ice-candidate","targetId":"{}","candidate":{{}}}}"#, a_id),
            )
            .await;
        // B saw user-left but no error frame.
        match b.next_frame() {
            ServerFrame::UserLeft { participant_id } => assert_eq!(participant_id, a_id),
            other => panic!("expected user-left, got {:?}", other),
        }
        assert!(b.no_frames());
    }

    #[tokio::test]
    async fn chat_is_stamped_and_not_echoed() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        let mut c = TestPeer::new();
        let a_id = join(&router, &mut a, "r1", "A").await;
        join(&router, &mut b, "r1", "B").await;
        join(&router, &mut c, "r1", "C").await;
        while !a.no_frames() {}
        while !b.no_frames() {}

        router
            .handle_text(&mut a.session, r#"{"type":"chat","message":"hi"}"#)
            .await;

        for peer in [&mut b, &mut c] {
            match peer.next_frame() {
                ServerFrame::Chat {
                    participant_id,
                    display_name,
                    message,
                    ..
                } => {
                    assert_eq!(participant_id, a_id);
                    assert_eq!(display_name, "A");
                    assert_eq!(message, "hi");
                }
                other => panic!("expected chat, got {:?}", other),
            }
        }
        assert!(a.no_frames());
    }

    #[tokio::test]
    async fn toggle_broadcasts_to_others_only() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        let a_id = join(&router, &mut a, "r1", "A").await;
        join(&router, &mut b, "r1", "B").await;
        while !a.no_frames() {}

        router
            .handle_text(&mut a.session, r#"{"type":"toggle-audio","enabled":false}"#)
            .await;
        match b.next_frame() {
            ServerFrame::AudioToggled {
                participant_id,
                enabled,
            } => {
                assert_eq!(participant_id, a_id);
                assert!(!enabled);
            }
            other => panic!("expected audio-toggled, got {:?}", other),
        }
        assert!(a.no_frames());
    }

    #[tokio::test]
    async fn toggle_after_leave_is_noop() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        join(&router, &mut a, "r1", "A").await;
        join(&router, &mut b, "r1", "B").await;
        while !a.no_frames() {}

        router.handle_disconnect(&mut b.session).await;
        a.next_frame(); // user-left
        router
            .handle_text(&mut b.session, r#"{"type":"toggle-video","enabled":false}"#)
            .await;
        assert!(a.no_frames());
    }

    #[tokio::test]
    async fn malformed_frame_returns_error_and_keeps_connection() {
        let router = router();
        let mut a = TestPeer::new();
        join(&router, &mut a, "r1", "A").await;

        router.handle_text(&mut a.session, "{broken").await;
        match a.next_frame() {
            ServerFrame::Error { .. } => {}
            other => panic!("expected error frame, got {:?}", other),
        }

        // Connection still usable afterwards.
        router
            .handle_text(&mut a.session, r#"{"type":"chat","message":"still here"}"#)
            .await;
        assert!(a.session.participant_id().is_some());
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored_without_error() {
        let router = router();
        let mut a = TestPeer::new();
        join(&router, &mut a, "r1", "A").await;

        router
            .handle_text(&mut a.session, r#"{"type":"reaction","emoji":"+1"}"#)
            .await;
        assert!(a.no_frames());
    }

    #[tokio::test]
    async fn leave_then_close_broadcasts_once() {
        let router = router();
        let mut a = TestPeer::new();
        let mut b = TestPeer::new();
        join(&router, &mut a, "r1", "A").await;
        let b_id = join(&router, &mut b, "r1", "B").await;
        while !a.no_frames() {}

        router
            .handle_text(&mut b.session, r#"{"type":"leave"}"#)
            .await;
        // Transport close arrives afterwards.
        router.handle_disconnect(&mut b.session).await;

        match a.next_frame() {
            ServerFrame::UserLeft { participant_id } => assert_eq!(participant_id, b_id),
            other => panic!("expected user-left, got {:?}", other),
        }
        assert!(a.no_frames());
    }

    #[tokio::test]
    async fn fallback_display_name_handles_multibyte_user_ids() {
        let router = router();
        let (tx, _rx) = mpsc::unbounded_channel();
        // Verifier-issued user ids are arbitrary strings, not UUIDs.
        let mut a = Session::new(
            ConnectionHandle::new(tx),
            "识别符号测试用户附加".to_owned(),
        );
        router
            .handle_text(&mut a, r#"{"type":"join","roomId":"r1"}"#)
            .await;

        // The next joiner's roster carries A's fallback name, truncated by
        // characters rather than bytes.
        let mut b = TestPeer::new();
        router
            .handle_text(
                &mut b.session,
                r#"{"type":"join","roomId":"r1","displayName":"B"}"#,
            )
            .await;
        match b.next_frame() {
            ServerFrame::Joined { participants, .. } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].display_name, "User 识别符号测试用户");
            }
            other => panic!("expected joined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_join_on_same_connection_is_ignored() {
        let router = router();
        let mut a = TestPeer::new();
        let first = join(&router, &mut a, "r1", "A").await;

        router
            .handle_text(&mut a.session, r#"{"type":"join","roomId":"r2","displayName":"A2"}"#)
            .await;
        assert!(a.no_frames());
        assert_eq!(a.session.participant_id(), Some(first.as_str()));
    }
}
