//! Persistence collaborator for room and call-duration records.
//!
//! The protocol layer never depends on the store being up: the router logs
//! store failures at debug level and keeps going in-memory.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ConferenceStore: Send + Sync {
    /// Whether the room was provisioned out-of-band. A `false` or an error
    /// only produces a log line; joins always proceed in-memory.
    async fn room_exists(&self, room_id: &str) -> Result<bool>;

    async fn record_join(
        &self,
        room_id: &str,
        participant_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> Result<()>;

    async fn record_leave(&self, participant_id: &str, call_duration: Duration) -> Result<()>;
}

/// Store used when no persistence backend is wired up.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl ConferenceStore for NullStore {
    async fn room_exists(&self, _room_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn record_join(
        &self,
        _room_id: &str,
        _participant_id: &str,
        _user_id: &str,
        _display_name: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn record_leave(&self, _participant_id: &str, _call_duration: Duration) -> Result<()> {
        Ok(())
    }
}
