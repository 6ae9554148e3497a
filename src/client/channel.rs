//! WebSocket transport for the signaling protocol.
//!
//! The channel owns one background task that dials, pumps frames both ways,
//! and redials with exponential backoff when the transport drops. A `leave`
//! frame flips the channel into deliberate-close mode: the frame is flushed,
//! the socket is closed, and no reconnect is attempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::client::status::{ChannelState, StatusMonitor};
use crate::protocol::{ClientFrame, ServerFrame};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY_MS: u64 = 1000;

/// Backoff for the given consecutive-failure count, or `None` once the retry
/// budget is spent. Doubles each time: 1s, 2s, 4s, 8s, 16s.
pub fn reconnect_delay(attempt: u32) -> Option<Duration> {
    (attempt < MAX_RECONNECT_ATTEMPTS).then(|| Duration::from_millis(RECONNECT_DELAY_MS << attempt))
}

/// What the client loop observes about the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The socket is up. `reconnect` is false only for the first connection.
    Opened { reconnect: bool },
    Frame(ServerFrame),
    /// The socket went down. `retrying` says whether a redial is coming.
    Closed { retrying: bool },
}

pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    leaving: Arc<AtomicBool>,
    leave_signal: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SignalingChannel {
    /// Starts the connection task. Frames sent while the transport is down
    /// queue up and flush after the redial.
    pub fn connect(
        url: String,
        monitor: StatusMonitor,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let leaving = Arc::new(AtomicBool::new(false));
        let leave_signal = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            url,
            outbound_rx,
            events,
            monitor,
            leaving.clone(),
            leave_signal.clone(),
        ));
        (
            Self {
                outbound,
                leaving,
                leave_signal,
                task,
            },
            events_rx,
        )
    }

    /// Sender half for anything that produces outbound frames.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientFrame> {
        self.outbound.clone()
    }

    pub fn send(&self, frame: ClientFrame) {
        if self.outbound.send(frame).is_err() {
            debug!("channel task gone, frame dropped");
        }
    }

    /// Announces departure and shuts the transport down for good. A pending
    /// backoff timer is cancelled; no redial follows.
    pub fn leave(&self) {
        self.leaving.store(true, Ordering::SeqCst);
        self.leave_signal.notify_one();
        self.send(ClientFrame::Leave);
    }

    pub fn abort(&self) {
        self.leaving.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

async fn run(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    monitor: StatusMonitor,
    leaving: Arc<AtomicBool>,
    leave_signal: Arc<Notify>,
) {
    let mut attempt: u32 = 0;
    let mut reconnect = false;
    loop {
        // A leave issued at any point, including during the backoff sleep,
        // means no further dialing.
        if leaving.load(Ordering::SeqCst) {
            break;
        }
        monitor.update_channel(if reconnect {
            ChannelState::Reconnecting
        } else {
            ChannelState::Connecting
        });

        match connect_async(&url).await {
            Ok((ws, _)) => {
                attempt = 0;
                monitor.update_channel(ChannelState::Connected);
                info!("signaling channel up ({})", url);
                let _ = events.send(ChannelEvent::Opened { reconnect });
                reconnect = true;

                if pump(ws, &mut outbound, &events, &leaving).await {
                    // Deliberate close, either `leave` went out or the client
                    // handle was dropped.
                    break;
                }
            }
            Err(e) => {
                warn!("signaling connect failed: {}", e);
                monitor.set_error(format!("connect failed: {}", e));
            }
        }

        if leaving.load(Ordering::SeqCst) {
            break;
        }
        match reconnect_delay(attempt) {
            Some(delay) => {
                attempt += 1;
                let _ = events.send(ChannelEvent::Closed { retrying: true });
                debug!("redialing in {:?} (attempt {})", delay, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = leave_signal.notified() => {}
                }
            }
            None => {
                warn!("signaling retry budget exhausted");
                break;
            }
        }
    }
    monitor.update_channel(ChannelState::Disconnected);
    let _ = events.send(ChannelEvent::Closed { retrying: false });
}

/// Drives one live socket. Returns true when the close was deliberate and the
/// task should stop instead of redialing.
async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    leaving: &AtomicBool,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let is_leave = matches!(frame, ClientFrame::Leave);
                    match serde_json::to_string(&frame) {
                        Ok(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                return leaving.load(Ordering::SeqCst);
                            }
                        }
                        Err(e) => warn!("unencodable outbound frame: {}", e),
                    }
                    if is_leave {
                        let _ = write.send(Message::Close(None)).await;
                        return true;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => {
                        let _ = events.send(ChannelEvent::Frame(frame));
                    }
                    Err(e) => warn!("unreadable inbound frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return leaving.load(Ordering::SeqCst),
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    debug!("signaling read error: {}", e);
                    return leaving.load(Ordering::SeqCst);
                }
            },
        }
    }
}
