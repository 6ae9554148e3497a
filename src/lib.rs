//! Full-mesh WebRTC conferencing over WebSocket signaling.
//!
//! The [`server`] half is a standalone signaling service: it tracks rooms,
//! relays SDP and ICE between participants, and fans presence, chat, and
//! media-toggle state out to a room. The [`client`] half joins a room,
//! negotiates one peer connection per other participant (the later joiner
//! always initiates), and keeps the mesh alive across signaling drops and
//! single ICE failures.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
