use std::env;

use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_PORT: u16 = 3001;

/// One STUN or TURN entry handed to the native RTC stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            ..Default::default()
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: username.to_owned(),
            credential: credential.to_owned(),
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl ServerConfig {
    /// Reads `PORT` (default 3001), binding on all interfaces.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        Self {
            bind_addr: format!("0.0.0.0:{}", port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub room_id: String,
    pub display_name: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
}

impl ClientConfig {
    pub fn new(signaling_url: &str, room_id: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_owned(),
            room_id: room_id.to_owned(),
            display_name: None,
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_URL)],
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_owned());
        self
    }

    /// Builds the ICE server list from `TURN_SERVER`, `TURN_SERVER2`,
    /// `TURN_USERNAME` and `TURN_PASSWORD`, always starting with the public
    /// STUN default. A Xirsys TURN URL gets the TCP fallback relay appended.
    pub fn with_ice_from_env(mut self) -> Self {
        let turn1 = env::var("TURN_SERVER").unwrap_or_default();
        let turn2 = env::var("TURN_SERVER2").unwrap_or_default();
        let user = env::var("TURN_USERNAME").unwrap_or_default();
        let pass = env::var("TURN_PASSWORD").unwrap_or_default();

        let mut servers = vec![IceServerConfig::stun(DEFAULT_STUN_URL)];
        if !turn1.is_empty() && !user.is_empty() && !pass.is_empty() {
            servers.push(IceServerConfig::turn(&turn1, &user, &pass));
        }
        if !turn2.is_empty() && !user.is_empty() && !pass.is_empty() {
            servers.push(IceServerConfig::turn(&turn2, &user, &pass));
        }
        if turn1.contains("global.xirsys.net") && !user.is_empty() && !pass.is_empty() {
            servers.push(IceServerConfig::turn(
                "turns:global.xirsys.net:5349?transport=tcp",
                &user,
                &pass,
            ));
        }

        self.ice_servers = servers;
        self
    }
}
