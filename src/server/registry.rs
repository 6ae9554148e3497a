//! In-memory room and connection registries.
//!
//! All mutation goes through one async mutex, so a roster snapshot handed to
//! a joiner can never miss a participant whose join completed earlier. For
//! any two racing joins to the same room, exactly one of them observes the
//! other in its snapshot, which is what keeps the later-joiner-initiates rule
//! glare-free.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::protocol::{ParticipantSummary, ServerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub user_id: String,
    pub display_name: String,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
}

impl ParticipantInfo {
    pub fn new(participant_id: &str, user_id: &str, display_name: &str) -> Self {
        Self {
            participant_id: participant_id.to_owned(),
            user_id: user_id.to_owned(),
            display_name: display_name.to_owned(),
            is_audio_enabled: true,
            is_video_enabled: true,
        }
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            is_audio_enabled: self.is_audio_enabled,
            is_video_enabled: self.is_video_enabled,
        }
    }
}

/// Handle to a live connection's writer task. Sends are best-effort: a dead
/// receiver only makes `send` report `false`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.tx.send(Message::Text(json)).is_ok(),
            Err(e) => {
                debug!("failed to encode outbound frame: {}", e);
                false
            }
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// roomId -> participantId -> info. A room exists iff it has members.
    rooms: HashMap<String, HashMap<String, ParticipantInfo>>,
    /// participantId -> live transport handle.
    connections: HashMap<String, ConnectionHandle>,
    /// participantId -> roomId, for O(1) leave and peer lookup.
    membership: HashMap<String, String>,
}

/// Shared room/connection state, injected into the router.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<RegistryInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the participant into the room (creating it if absent),
    /// registers the connection handle and returns the roster as it existed
    /// at join time, excluding the joiner.
    pub async fn join(
        &self,
        room_id: &str,
        info: ParticipantInfo,
        handle: ConnectionHandle,
    ) -> Vec<ParticipantSummary> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.entry(room_id.to_owned()).or_default();
        let snapshot = room
            .values()
            .filter(|p| p.participant_id != info.participant_id)
            .map(ParticipantInfo::summary)
            .collect();

        let participant_id = info.participant_id.clone();
        room.insert(participant_id.clone(), info);
        inner.membership.insert(participant_id.clone(), room_id.to_owned());
        inner.connections.insert(participant_id, handle);
        snapshot
    }

    /// Removes the participant from its room and the connection registry,
    /// deleting the room once empty. Unknown participants are a no-op, so a
    /// deliberate leave followed by the transport close is harmless.
    pub async fn leave(&self, participant_id: &str) -> Option<LeaveOutcome> {
        let mut inner = self.inner.lock().await;
        let room_id = inner.membership.remove(participant_id)?;
        inner.connections.remove(participant_id);

        let mut peers = Vec::new();
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.remove(participant_id);
            if room.is_empty() {
                inner.rooms.remove(&room_id);
            } else {
                let remaining: Vec<String> = inner.rooms[&room_id].keys().cloned().collect();
                peers = remaining
                    .iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect();
            }
        }
        Some(LeaveOutcome { room_id, peers })
    }

    /// Flips an audio/video flag. Silently ignores unknown participants,
    /// which covers a toggle racing with a leave.
    pub async fn set_toggle(&self, participant_id: &str, kind: MediaKind, enabled: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(room_id) = inner.membership.get(participant_id).cloned() else {
            return false;
        };
        let Some(info) = inner
            .rooms
            .get_mut(&room_id)
            .and_then(|room| room.get_mut(participant_id))
        else {
            return false;
        };
        match kind {
            MediaKind::Audio => info.is_audio_enabled = enabled,
            MediaKind::Video => info.is_video_enabled = enabled,
        }
        true
    }

    pub async fn lookup(&self, participant_id: &str) -> Option<ConnectionHandle> {
        self.inner.lock().await.connections.get(participant_id).cloned()
    }

    /// Handles of everyone sharing a room with `participant_id`, excluding
    /// the participant itself. The broadcast set for relayed events.
    pub async fn peers_of(&self, participant_id: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().await;
        let Some(room_id) = inner.membership.get(participant_id) else {
            return Vec::new();
        };
        let Some(room) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        room.keys()
            .filter(|id| id.as_str() != participant_id)
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub async fn room_len(&self, room_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .rooms
            .get(room_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

pub struct LeaveOutcome {
    pub room_id: String,
    /// Handles of the participants still in the room, for `user-left`.
    pub peers: Vec<ConnectionHandle>,
}
