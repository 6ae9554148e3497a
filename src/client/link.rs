//! Per-remote-participant negotiation state machine.
//!
//! Candidates that arrive before the remote description is set are queued in
//! arrival order and applied exactly once right after it is; afterwards they
//! apply immediately. All of it happens under the link's own mutex, so two
//! operations never race on one link while distinct links stay independent.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::media::PeerMedia;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerSent,
    Stable,
    Closed,
}

/// Which side of the pair originates the offer. The later joiner is always
/// the initiator; the other side only ever answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

struct LinkInner {
    state: NegotiationState,
    remote_set: bool,
    pending: VecDeque<Value>,
    restarted: bool,
}

pub struct PeerLink<P: PeerMedia> {
    remote_id: String,
    role: Role,
    media: P,
    inner: Mutex<LinkInner>,
}

impl<P: PeerMedia> PeerLink<P> {
    pub fn new(remote_id: &str, role: Role, media: P) -> Self {
        Self {
            remote_id: remote_id.to_owned(),
            role,
            media,
            inner: Mutex::new(LinkInner {
                state: NegotiationState::Idle,
                remote_set: false,
                pending: VecDeque::new(),
                restarted: false,
            }),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    /// Initiator path: create and apply the local offer. Valid once, from
    /// `Idle`.
    pub async fn send_offer(&self) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        if inner.state != NegotiationState::Idle {
            return Err(Error::Signaling(format!(
                "offer already in flight for {}",
                self.remote_id
            )));
        }
        let offer = self.media.create_offer().await?;
        inner.state = NegotiationState::OfferSent;
        debug!("link {}: Idle -> OfferSent", self.remote_id);
        Ok(offer)
    }

    /// Responder path: apply the remote offer, produce the answer, then flush
    /// whatever candidates were queued while the offer was in flight. Also
    /// accepts a renegotiation offer on a `Stable` link (remote ICE restart).
    pub async fn accept_offer(&self, offer: Value) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            return Err(Error::Signaling(format!("link {} is closed", self.remote_id)));
        }
        if inner.state == NegotiationState::OfferSent {
            // Should be unreachable under the later-joiner rule.
            warn!("link {}: offer received while one is in flight", self.remote_id);
        }
        inner.state = NegotiationState::AnswerSent;
        let answer = self.media.apply_offer(offer).await?;
        inner.remote_set = true;
        inner.state = NegotiationState::Stable;
        debug!("link {}: AnswerSent -> Stable", self.remote_id);
        self.flush_pending(&mut inner).await;
        Ok(answer)
    }

    /// Initiator path: only meaningful while an offer is outstanding. A stray
    /// or duplicate answer is logged and dropped.
    pub async fn accept_answer(&self, answer: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != NegotiationState::OfferSent {
            warn!(
                "link {}: ignoring answer in state {:?}",
                self.remote_id, inner.state
            );
            return Ok(());
        }
        self.media.apply_answer(answer).await?;
        inner.remote_set = true;
        inner.state = NegotiationState::Stable;
        debug!("link {}: OfferSent -> Stable", self.remote_id);
        self.flush_pending(&mut inner).await;
        Ok(())
    }

    /// Applies the candidate now if the remote description is in place,
    /// otherwise queues it.
    pub async fn add_candidate(&self, candidate: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            return Ok(());
        }
        if inner.remote_set {
            self.media.apply_candidate(candidate).await?;
        } else {
            inner.pending.push_back(candidate);
        }
        Ok(())
    }

    /// One in-place recovery attempt. Returns the ICE-restart offer to send,
    /// or `None` when the link is beyond saving and must be evicted.
    pub async fn on_failed(&self) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        if inner.restarted || inner.state == NegotiationState::Closed {
            inner.state = NegotiationState::Closed;
            return None;
        }
        inner.restarted = true;
        match self.media.restart_ice().await {
            Ok(offer) => {
                inner.state = NegotiationState::OfferSent;
                inner.remote_set = false;
                inner.pending.clear();
                debug!("link {}: restarting ICE", self.remote_id);
                Some(offer)
            }
            Err(e) => {
                warn!("link {}: ICE restart failed: {}", self.remote_id, e);
                inner.state = NegotiationState::Closed;
                None
            }
        }
    }

    /// Swaps the outgoing video track without touching negotiation state.
    pub async fn replace_video(&self, track: P::Track) -> Result<()> {
        self.media.replace_video_track(track).await
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == NegotiationState::Closed {
            return;
        }
        inner.state = NegotiationState::Closed;
        inner.pending.clear();
        if let Err(e) = self.media.close().await {
            debug!("link {}: close error: {}", self.remote_id, e);
        }
    }

    /// FIFO, exactly once: the queue is drained and then discarded. A bad
    /// candidate is skipped so the rest still apply.
    async fn flush_pending(&self, inner: &mut LinkInner) {
        while let Some(candidate) = inner.pending.pop_front() {
            if let Err(e) = self.media.apply_candidate(candidate).await {
                warn!("link {}: dropping queued candidate: {}", self.remote_id, e);
            }
        }
    }
}
