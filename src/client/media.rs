//! Seam between the negotiation engine and the native RTC stack.
//!
//! The engine only sees the [`MediaStack`]/[`PeerMedia`] traits; the real
//! implementation wraps the `webrtc` crate. SDP and candidates cross the seam
//! as JSON values because that is exactly what the signaling channel carries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::ClientFrame;

/// Out-of-band notifications from the media layer to the client loop.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The peer connection for this remote entered the failed state.
    LinkFailed(String),
    /// The platform stopped the screen capture source (e.g. the user hit the
    /// browser's own "stop sharing" button).
    ScreenSourceEnded,
}

/// One remote participant's slice of the native stack.
#[async_trait]
pub trait PeerMedia: Send + Sync + 'static {
    type Track: Clone + Send + Sync + 'static;

    /// Creates and applies a local offer, returning its wire form.
    async fn create_offer(&self) -> Result<Value>;

    /// Applies a remote offer and returns the locally-applied answer.
    async fn apply_offer(&self, offer: Value) -> Result<Value>;

    /// Applies a remote answer.
    async fn apply_answer(&self, answer: Value) -> Result<()>;

    async fn apply_candidate(&self, candidate: Value) -> Result<()>;

    /// Creates and applies an ICE-restart offer.
    async fn restart_ice(&self) -> Result<Value>;

    /// Swaps the outgoing video track in place, with no renegotiation.
    async fn replace_video_track(&self, track: Self::Track) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Local media source plus peer-connection factory.
#[async_trait]
pub trait MediaStack: Send + Sync + 'static {
    type Track: Clone + Send + Sync + 'static;
    type Peer: PeerMedia<Track = Self::Track>;

    async fn create_peer(&self, remote_id: &str) -> Result<Self::Peer>;

    async fn camera_video(&self) -> Result<Self::Track>;

    async fn screen_video(&self) -> Result<Self::Track>;

    /// Replaces the video track of the local composite stream, retiring the
    /// previous one, so links and the local preview stay consistent.
    async fn swap_local_video(&self, track: Self::Track) -> Result<()>;

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);

    /// Stops local media production. Part of the one-shot leave teardown.
    async fn stop_local(&self);
}

struct LocalTracks {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
}

/// `webrtc`-crate implementation of [`MediaStack`].
///
/// Locally produced candidates trickle straight onto the signaling channel
/// from the `on_ice_candidate` handler; the engine never sees them.
pub struct RtcMediaStack {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::UnboundedSender<MediaEvent>,
    local: Mutex<LocalTracks>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl RtcMediaStack {
    pub fn new(
        config: &ClientConfig,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.iter().map(|s| s.to_rtc()).collect(),
            outbound,
            events,
            local: Mutex::new(LocalTracks {
                audio: sample_track(MIME_TYPE_OPUS, "audio"),
                video: sample_track(MIME_TYPE_VP8, "video"),
            }),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        })
    }

    /// Current audio track handle, for the capture glue to write samples into.
    pub async fn local_audio(&self) -> Arc<TrackLocalStaticSample> {
        self.local.lock().await.audio.clone()
    }

    /// Current video track handle. Changes when screen share swaps the source.
    pub async fn local_video(&self) -> Arc<TrackLocalStaticSample> {
        self.local.lock().await.video.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }
}

fn sample_track(mime_type: &str, id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "webrtc-conference".to_owned(),
    ))
}

#[async_trait]
impl MediaStack for RtcMediaStack {
    type Track = Arc<TrackLocalStaticSample>;
    type Peer = RtcPeer;

    async fn create_peer(&self, remote_id: &str) -> Result<RtcPeer> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        {
            let local = self.local.lock().await;
            pc.add_track(local.audio.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            pc.add_track(local.video.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        // Trickle: each gathered candidate goes out addressed to this remote.
        let outbound = self.outbound.clone();
        let target_id = remote_id.to_owned();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound.clone();
            let target_id = target_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(candidate) => {
                            let _ = outbound.send(ClientFrame::IceCandidate {
                                target_id,
                                candidate,
                            });
                        }
                        Err(e) => warn!("failed to encode local candidate: {}", e),
                    },
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        let remote = remote_id.to_owned();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let remote = remote.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send(MediaEvent::LinkFailed(remote));
                }
            })
        }));

        Ok(RtcPeer { pc })
    }

    async fn camera_video(&self) -> Result<Self::Track> {
        Ok(sample_track(MIME_TYPE_VP8, "video"))
    }

    async fn screen_video(&self) -> Result<Self::Track> {
        Ok(sample_track(MIME_TYPE_VP8, "screen"))
    }

    async fn swap_local_video(&self, track: Self::Track) -> Result<()> {
        // Dropping the old handle retires it: the capture glue re-fetches
        // `local_video` and stops feeding the replaced track.
        self.local.lock().await.video = track;
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn stop_local(&self) {
        self.audio_enabled.store(false, Ordering::SeqCst);
        self.video_enabled.store(false, Ordering::SeqCst);
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerMedia for RtcPeer {
    type Track = Arc<TrackLocalStaticSample>;

    async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(&offer)?)
    }

    async fn apply_offer(&self, offer: Value) -> Result<Value> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(&answer)?)
    }

    async fn apply_answer(&self, answer: Value) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn apply_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn restart_ice(&self) -> Result<Value> {
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(&offer)?)
    }

    async fn replace_video_track(&self, track: Self::Track) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let is_video = sender
                .track()
                .await
                .map(|t| t.kind() == RTPCodecType::Video)
                .unwrap_or(false);
            if is_video {
                sender
                    .replace_track(Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>))
                    .await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
