//! Mesh orchestration: one [`PeerLink`] per remote participant.
//!
//! The offer direction is fixed by join order: this client initiates toward
//! everyone already in the room when it joins, and answers everyone who joins
//! later. The two sides of a pair therefore never offer at the same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::client::link::{NegotiationState, PeerLink, Role};
use crate::client::media::MediaStack;
use crate::client::status::{LinkQuality, StatusMonitor};
use crate::error::Result;
use crate::protocol::{ClientFrame, ParticipantSummary};

pub struct NegotiationEngine<S: MediaStack> {
    stack: Arc<S>,
    links: Mutex<HashMap<String, Arc<PeerLink<S::Peer>>>>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    monitor: StatusMonitor,
    screen_sharing: AtomicBool,
    closed: AtomicBool,
}

impl<S: MediaStack> NegotiationEngine<S> {
    pub fn new(
        stack: Arc<S>,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        monitor: StatusMonitor,
    ) -> Self {
        Self {
            stack,
            links: Mutex::new(HashMap::new()),
            outbound,
            monitor,
            screen_sharing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Joiner side of the mesh: offer to every participant already in the
    /// room, concurrently. A peer that fails to set up is skipped so the rest
    /// of the mesh still comes up.
    pub async fn connect_to_existing(&self, participants: &[ParticipantSummary]) {
        let mut created = Vec::with_capacity(participants.len());
        for participant in participants {
            let id = &participant.participant_id;
            match self.ensure_link(id, Role::Initiator).await {
                Ok(link) => created.push(link),
                Err(e) => warn!("skipping peer {}: {}", id, e),
            }
        }

        let offers = join_all(created.iter().map(|link| async move {
            (link.remote_id().to_owned(), link.send_offer().await)
        }))
        .await;

        for (remote_id, offer) in offers {
            match offer {
                Ok(offer) => self.send(ClientFrame::Offer {
                    target_id: remote_id,
                    offer,
                }),
                Err(e) => warn!("offer to {} failed: {}", remote_id, e),
            }
        }
    }

    /// Newcomer announced by the room: set up a responder link and wait for
    /// their offer. We never initiate toward a later joiner.
    pub async fn prepare_for(&self, participant_id: &str) {
        if let Err(e) = self.ensure_link(participant_id, Role::Responder).await {
            warn!("could not prepare link for {}: {}", participant_id, e);
        }
    }

    /// A later joiner sent us an offer: answer it. An already-stable link
    /// means the remote is restarting ICE.
    pub async fn handle_offer(&self, from: &str, offer: Value) -> Result<()> {
        let link = self.ensure_link(from, Role::Responder).await?;
        let answer = link.accept_offer(offer).await?;
        self.monitor.update_quality(LinkQuality::Good);
        self.send(ClientFrame::Answer {
            target_id: from.to_owned(),
            answer,
        });
        Ok(())
    }

    pub async fn handle_answer(&self, from: &str, answer: Value) -> Result<()> {
        match self.link(from).await {
            Some(link) => {
                link.accept_answer(answer).await?;
                if link.state().await == NegotiationState::Stable {
                    self.monitor.update_quality(LinkQuality::Good);
                }
                Ok(())
            }
            None => {
                warn!("answer from unknown peer {}", from);
                Ok(())
            }
        }
    }

    /// Per-connection frame order guarantees the offer precedes the sender's
    /// candidates, so a candidate without a link means the peer already left.
    pub async fn handle_candidate(&self, from: &str, candidate: Value) -> Result<()> {
        match self.link(from).await {
            Some(link) => link.add_candidate(candidate).await,
            None => {
                debug!("dropping candidate from unknown peer {}", from);
                Ok(())
            }
        }
    }

    pub async fn handle_peer_left(&self, participant_id: &str) {
        let removed = self.links.lock().await.remove(participant_id);
        if let Some(link) = removed {
            link.close().await;
            info!("closed link to departed peer {}", participant_id);
        }
    }

    /// Connection-failure policy: one ICE restart, then give up and tear the
    /// link down. Quality drops to `Medium` while the restart is in flight
    /// and to `Poor` once a link is lost for good; a completed exchange
    /// raises it back to `Good`.
    pub async fn handle_link_failed(&self, participant_id: &str) {
        let Some(link) = self.link(participant_id).await else {
            return;
        };
        match link.on_failed().await {
            Some(offer) => {
                self.monitor.update_quality(LinkQuality::Medium);
                self.send(ClientFrame::Offer {
                    target_id: participant_id.to_owned(),
                    offer,
                });
            }
            None => {
                warn!("link to {} unrecoverable, removing", participant_id);
                self.monitor.update_quality(LinkQuality::Poor);
                self.links.lock().await.remove(participant_id);
                link.close().await;
            }
        }
    }

    /// Switches the outgoing video of every link to screen capture. Pure
    /// `replace_track`: no renegotiation, no signaling traffic.
    pub async fn start_screen_share(&self) -> Result<()> {
        if self.screen_sharing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let track = self.stack.screen_video().await?;
        self.swap_video_everywhere(track).await;
        info!("screen share started");
        Ok(())
    }

    /// Restores the camera on every link. Also the path taken when the
    /// platform ends the capture source itself.
    pub async fn stop_screen_share(&self) -> Result<()> {
        if !self.screen_sharing.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let track = self.stack.camera_video().await?;
        self.swap_video_everywhere(track).await;
        info!("screen share stopped");
        Ok(())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_sharing.load(Ordering::SeqCst)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.stack.set_audio_enabled(enabled);
        self.send(ClientFrame::ToggleAudio { enabled });
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.stack.set_video_enabled(enabled);
        self.send(ClientFrame::ToggleVideo { enabled });
    }

    /// Drops every link but keeps local media running. Used when the
    /// signaling channel comes back and the mesh is rebuilt from a fresh
    /// join.
    pub async fn reset(&self) {
        let links: Vec<_> = self.links.lock().await.drain().collect();
        for (_, link) in links {
            link.close().await;
        }
    }

    /// One-shot teardown: closes every link and stops local media. Safe to
    /// call from multiple paths; only the first caller does the work.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let links: Vec<_> = self.links.lock().await.drain().collect();
        for (_, link) in links {
            link.close().await;
        }
        self.stack.stop_local().await;
    }

    /// Get-or-create, the only way links come into existence. The map lock is
    /// held across peer creation so two callers can never race in a second
    /// link for the same remote.
    async fn ensure_link(&self, remote_id: &str, role: Role) -> Result<Arc<PeerLink<S::Peer>>> {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(remote_id) {
            return Ok(link.clone());
        }
        let peer = self.stack.create_peer(remote_id).await?;
        let link = Arc::new(PeerLink::new(remote_id, role, peer));
        links.insert(remote_id.to_owned(), link.clone());
        Ok(link)
    }

    async fn link(&self, remote_id: &str) -> Option<Arc<PeerLink<S::Peer>>> {
        self.links.lock().await.get(remote_id).cloned()
    }

    async fn swap_video_everywhere(&self, track: S::Track) {
        if let Err(e) = self.stack.swap_local_video(track.clone()).await {
            warn!("local video swap failed: {}", e);
        }
        let links: Vec<_> = self.links.lock().await.values().cloned().collect();
        for link in links {
            if let Err(e) = link.replace_video(track.clone()).await {
                warn!("video swap on link {} failed: {}", link.remote_id(), e);
            }
        }
    }

    fn send(&self, frame: ClientFrame) {
        if self.outbound.send(frame).is_err() {
            debug!("outbound channel closed, frame dropped");
        }
    }

    #[cfg(test)]
    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }
}
