//! Wire vocabulary for the signaling channel.
//!
//! Every frame is a JSON object with a mandatory `type` tag. SDP and ICE
//! payloads stay opaque [`serde_json::Value`]s: the router relays them
//! verbatim and only the native RTC stack interprets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Roster entry handed to a joiner and kept in the client-side room view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub display_name: String,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
}

/// Frames sent by a client to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Offer { target_id: String, offer: Value },
    #[serde(rename_all = "camelCase")]
    Answer { target_id: String, answer: Value },
    #[serde(rename_all = "camelCase")]
    IceCandidate { target_id: String, candidate: Value },
    ToggleAudio { enabled: bool },
    ToggleVideo { enabled: bool },
    Chat { message: String },
    #[serde(rename_all = "camelCase")]
    Typing { is_typing: bool },
    Leave,
}

/// Frames sent by the router to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Joined {
        participant_id: String,
        room_id: String,
        participants: Vec<ParticipantSummary>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        participant_id: String,
        display_name: String,
    },
    Offer { from: String, offer: Value },
    Answer { from: String, answer: Value },
    IceCandidate { from: String, candidate: Value },
    #[serde(rename_all = "camelCase")]
    AudioToggled {
        participant_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    VideoToggled {
        participant_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        participant_id: String,
        display_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        participant_id: String,
        display_name: String,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { participant_id: String },
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        participant_id: String,
        display_name: String,
        action: String,
    },
    Error { message: String },
}

/// Message kinds the router understands. Anything else is ignored rather
/// than treated as malformed, so newer clients don't get kicked.
const CLIENT_KINDS: &[&str] = &[
    "join",
    "offer",
    "answer",
    "ice-candidate",
    "toggle-audio",
    "toggle-video",
    "chat",
    "typing",
    "leave",
];

/// Decodes an inbound frame.
///
/// Returns `Ok(None)` for a well-formed frame of unknown kind and
/// `Err(Error::Protocol)` for anything that is not a valid frame of a known
/// kind.
pub fn parse_client_frame(text: &str) -> crate::error::Result<Option<ClientFrame>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid JSON: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("missing type field".to_owned()))?;
    if !CLIENT_KINDS.contains(&kind) {
        return Ok(None);
    }
    let kind = kind.to_owned();
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed {} frame: {}", kind, e)))
}
