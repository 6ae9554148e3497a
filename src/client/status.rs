use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "Disconnected"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Connected => write!(f, "Connected"),
            ChannelState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Coarse mesh health shown next to the video tiles.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkQuality {
    Good,
    Medium,
    Poor,
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkQuality::Good => write!(f, "good"),
            LinkQuality::Medium => write!(f, "medium"),
            LinkQuality::Poor => write!(f, "poor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub channel: ChannelState,
    pub quality: LinkQuality,
    pub last_error: Option<String>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            channel: ChannelState::Disconnected,
            quality: LinkQuality::Good,
            last_error: None,
        }
    }
}

/// Publishes client state to the embedding UI over a watch channel.
#[derive(Clone)]
pub struct StatusMonitor {
    status: Arc<watch::Sender<ClientStatus>>,
    receiver: watch::Receiver<ClientStatus>,
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ClientStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_channel(&self, state: ChannelState) {
        self.status.send_modify(|status| {
            status.channel = state;
        });
    }

    pub fn update_quality(&self, quality: LinkQuality) {
        self.status.send_modify(|status| {
            status.quality = quality;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn current(&self) -> ClientStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.receiver.clone()
    }
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_are_observable() {
        let monitor = StatusMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.update_channel(ChannelState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().channel, ChannelState::Connected);

        monitor.update_quality(LinkQuality::Poor);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().quality, LinkQuality::Poor);
        assert!(rx.borrow().last_error.is_none());
    }
}
