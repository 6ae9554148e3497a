//! Conference client: signaling channel, negotiation engine, and the event
//! loop that wires them to the embedding application.

pub mod channel;
pub mod engine;
pub mod link;
pub mod media;
pub mod status;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{ClientFrame, ParticipantSummary, ServerFrame};
use channel::{ChannelEvent, SignalingChannel};
use engine::NegotiationEngine;
use media::{MediaEvent, MediaStack, RtcMediaStack};
use status::{ClientStatus, StatusMonitor};

/// One entry in the client-side chat log. Own messages are appended locally
/// at send time, since the router never echoes chat back to the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub display_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
}

/// Client-side picture of the room: who is here, with what media flags, and
/// what has been said.
#[derive(Debug, Clone, Default)]
pub struct RoomView {
    pub own_id: Option<String>,
    pub participants: HashMap<String, ParticipantSummary>,
    pub chat: Vec<ChatEntry>,
}

/// What the embedding application sees of the conference.
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    /// We are in the room. `participants` is everyone who was already there.
    Joined {
        participant_id: String,
        participants: Vec<ParticipantSummary>,
    },
    ParticipantJoined(ParticipantSummary),
    ParticipantLeft {
        participant_id: String,
    },
    AudioToggled {
        participant_id: String,
        enabled: bool,
    },
    VideoToggled {
        participant_id: String,
        enabled: bool,
    },
    Chat {
        participant_id: String,
        display_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Typing {
        participant_id: String,
        display_name: String,
        is_typing: bool,
    },
    Presence {
        participant_id: String,
        display_name: String,
        action: String,
    },
    ServerError(String),
    /// The signaling channel dropped. When `retrying` is false the session is
    /// over and no more events follow.
    Disconnected {
        retrying: bool,
    },
}

pub struct ConferenceClient<S: MediaStack> {
    engine: Arc<NegotiationEngine<S>>,
    channel: SignalingChannel,
    monitor: StatusMonitor,
    view: Arc<StdMutex<RoomView>>,
    own_name: String,
    loop_task: JoinHandle<()>,
}

impl ConferenceClient<RtcMediaStack> {
    /// Dials the signaling server and starts the event loop over the native
    /// RTC stack.
    pub fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConferenceEvent>)> {
        let monitor = StatusMonitor::new();
        let (channel, channel_events) =
            SignalingChannel::connect(config.signaling_url.clone(), monitor.clone());
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let stack = Arc::new(RtcMediaStack::new(&config, channel.sender(), media_tx)?);
        Ok(Self::start(
            config,
            stack,
            media_rx,
            channel,
            channel_events,
            monitor,
        ))
    }
}

impl<S: MediaStack> ConferenceClient<S> {
    fn start(
        config: ClientConfig,
        stack: Arc<S>,
        media_rx: mpsc::UnboundedReceiver<MediaEvent>,
        channel: SignalingChannel,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        monitor: StatusMonitor,
    ) -> (Self, mpsc::UnboundedReceiver<ConferenceEvent>) {
        let engine = Arc::new(NegotiationEngine::new(
            stack,
            channel.sender(),
            monitor.clone(),
        ));
        let view = Arc::new(StdMutex::new(RoomView::default()));
        let own_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| "You".to_owned());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let loop_task = tokio::spawn(run_loop(
            engine.clone(),
            channel.sender(),
            channel_events,
            media_rx,
            out_tx,
            view.clone(),
            config.room_id,
            config.display_name,
        ));
        (
            Self {
                engine,
                channel,
                monitor,
                view,
                own_name,
                loop_task,
            },
            out_rx,
        )
    }

    pub fn status(&self) -> ClientStatus {
        self.monitor.current()
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<ClientStatus> {
        self.monitor.subscribe()
    }

    /// Snapshot of the roster and chat log.
    pub fn room_view(&self) -> RoomView {
        self.view
            .lock()
            .map(|view| view.clone())
            .unwrap_or_default()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.engine.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.engine.set_video_enabled(enabled);
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.engine.start_screen_share().await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.engine.stop_screen_share().await
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.engine.is_screen_sharing()
    }

    pub fn send_chat(&self, message: &str) {
        if let Ok(mut view) = self.view.lock() {
            view.chat.push(ChatEntry {
                display_name: self.own_name.clone(),
                message: message.to_owned(),
                timestamp: Utc::now(),
                is_own: true,
            });
        }
        self.channel.send(ClientFrame::Chat {
            message: message.to_owned(),
        });
    }

    pub fn set_typing(&self, is_typing: bool) {
        self.channel.send(ClientFrame::Typing { is_typing });
    }

    /// Leaves the room: announces departure, tears down every link, stops
    /// local media, and closes the transport. No reconnect follows.
    pub async fn leave(&self) {
        self.engine.shutdown().await;
        self.channel.leave();
    }

    /// Hard stop without the departure handshake.
    pub fn abort(&self) {
        self.channel.abort();
        self.loop_task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<S: MediaStack>(
    engine: Arc<NegotiationEngine<S>>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
    out: mpsc::UnboundedSender<ConferenceEvent>,
    view: Arc<StdMutex<RoomView>>,
    room_id: String,
    display_name: Option<String>,
) {
    let mut media_open = true;

    loop {
        tokio::select! {
            event = channel_events.recv() => match event {
                Some(ChannelEvent::Opened { reconnect }) => {
                    if reconnect {
                        // Fresh join means fresh links on both sides.
                        engine.reset().await;
                        if let Ok(mut view) = view.lock() {
                            view.own_id = None;
                            view.participants.clear();
                        }
                    }
                    let _ = outbound.send(ClientFrame::Join {
                        room_id: room_id.clone(),
                        display_name: display_name.clone(),
                    });
                }
                Some(ChannelEvent::Frame(frame)) => {
                    handle_frame(&engine, &out, &view, frame).await;
                }
                Some(ChannelEvent::Closed { retrying }) => {
                    let _ = out.send(ConferenceEvent::Disconnected { retrying });
                    if !retrying {
                        engine.shutdown().await;
                        return;
                    }
                }
                None => {
                    engine.shutdown().await;
                    return;
                }
            },
            event = media_events.recv(), if media_open => match event {
                Some(MediaEvent::LinkFailed(participant_id)) => {
                    warn!("link to {} failed", participant_id);
                    engine.handle_link_failed(&participant_id).await;
                }
                Some(MediaEvent::ScreenSourceEnded) => {
                    if let Err(e) = engine.stop_screen_share().await {
                        warn!("camera restore failed: {}", e);
                    }
                }
                None => media_open = false,
            },
        }
    }
}

fn with_view(view: &Arc<StdMutex<RoomView>>, f: impl FnOnce(&mut RoomView)) {
    if let Ok(mut view) = view.lock() {
        f(&mut view);
    }
}

async fn handle_frame<S: MediaStack>(
    engine: &NegotiationEngine<S>,
    out: &mpsc::UnboundedSender<ConferenceEvent>,
    view: &Arc<StdMutex<RoomView>>,
    frame: ServerFrame,
) {
    match frame {
        ServerFrame::Joined {
            participant_id,
            room_id,
            participants,
        } => {
            info!("joined {} as {}", room_id, participant_id);
            with_view(view, |view| {
                view.own_id = Some(participant_id.clone());
                for participant in &participants {
                    view.participants
                        .insert(participant.participant_id.clone(), participant.clone());
                }
            });
            engine.connect_to_existing(&participants).await;
            let _ = out.send(ConferenceEvent::Joined {
                participant_id,
                participants,
            });
        }
        ServerFrame::UserJoined {
            participant_id,
            display_name,
        } => {
            // The newcomer initiates; we stand up a responder link and wait
            // for their offer.
            engine.prepare_for(&participant_id).await;
            let summary = ParticipantSummary {
                participant_id: participant_id.clone(),
                display_name,
                is_audio_enabled: true,
                is_video_enabled: true,
            };
            with_view(view, |view| {
                view.participants.insert(participant_id, summary.clone());
            });
            let _ = out.send(ConferenceEvent::ParticipantJoined(summary));
        }
        ServerFrame::Offer { from, offer } => {
            if let Err(e) = engine.handle_offer(&from, offer).await {
                warn!("offer from {} failed: {}", from, e);
            }
        }
        ServerFrame::Answer { from, answer } => {
            if let Err(e) = engine.handle_answer(&from, answer).await {
                warn!("answer from {} failed: {}", from, e);
            }
        }
        ServerFrame::IceCandidate { from, candidate } => {
            if let Err(e) = engine.handle_candidate(&from, candidate).await {
                warn!("candidate from {} failed: {}", from, e);
            }
        }
        ServerFrame::AudioToggled {
            participant_id,
            enabled,
        } => {
            with_view(view, |view| {
                if let Some(entry) = view.participants.get_mut(&participant_id) {
                    entry.is_audio_enabled = enabled;
                }
            });
            let _ = out.send(ConferenceEvent::AudioToggled {
                participant_id,
                enabled,
            });
        }
        ServerFrame::VideoToggled {
            participant_id,
            enabled,
        } => {
            with_view(view, |view| {
                if let Some(entry) = view.participants.get_mut(&participant_id) {
                    entry.is_video_enabled = enabled;
                }
            });
            let _ = out.send(ConferenceEvent::VideoToggled {
                participant_id,
                enabled,
            });
        }
        ServerFrame::Chat {
            participant_id,
            display_name,
            message,
            timestamp,
        } => {
            with_view(view, |view| {
                view.chat.push(ChatEntry {
                    display_name: display_name.clone(),
                    message: message.clone(),
                    timestamp,
                    is_own: false,
                });
            });
            let _ = out.send(ConferenceEvent::Chat {
                participant_id,
                display_name,
                message,
                timestamp,
            });
        }
        ServerFrame::Typing {
            participant_id,
            display_name,
            is_typing,
        } => {
            let _ = out.send(ConferenceEvent::Typing {
                participant_id,
                display_name,
                is_typing,
            });
        }
        ServerFrame::UserLeft { participant_id } => {
            engine.handle_peer_left(&participant_id).await;
            with_view(view, |view| {
                view.participants.remove(&participant_id);
            });
            let _ = out.send(ConferenceEvent::ParticipantLeft { participant_id });
        }
        ServerFrame::PresenceUpdate {
            participant_id,
            display_name,
            action,
        } => {
            let _ = out.send(ConferenceEvent::Presence {
                participant_id,
                display_name,
                action,
            });
        }
        ServerFrame::Error { message } => {
            warn!("server error: {}", message);
            let _ = out.send(ConferenceEvent::ServerError(message));
        }
    }
}
