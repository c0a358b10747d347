use std::{env, fmt};

use secrecy::{ExposeSecret, Secret};
use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![DEFAULT_STUN.to_owned()],
        ..Default::default()
    }]
}

pub struct RtcConfig {
    pub address: String,
    pub port: u16,
    pub display_name: String,
    pub history_url: Option<String>,
    pub token: Secret<Option<String>>,
    pub ice_servers: Vec<RTCIceServer>,
}

impl fmt::Debug for RtcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("display_name", &self.display_name)
            .field("history_url", &self.history_url)
            .field("ice_servers", &self.ice_servers)
            .finish()
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfigBuilder::default().build()
    }
}

impl RtcConfig {
    /// Reads `MEET_RELAY_ADDRESS`, `MEET_RELAY_PORT`, `MEET_DISPLAY_NAME`,
    /// `MEET_HISTORY_URL` and `MEET_TOKEN`, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut builder = RtcConfigBuilder::new();
        if let Ok(address) = env::var("MEET_RELAY_ADDRESS") {
            builder = builder.address(address);
        }
        if let Ok(port) = env::var("MEET_RELAY_PORT") {
            builder = builder.port(port.parse()?);
        }
        if let Ok(name) = env::var("MEET_DISPLAY_NAME") {
            builder = builder.display_name(name);
        }
        if let Ok(url) = env::var("MEET_HISTORY_URL") {
            builder = builder.history_url(url);
        }
        if let Ok(token) = env::var("MEET_TOKEN") {
            builder = builder.token(token);
        }
        Ok(builder.build())
    }

    pub fn take_token(&mut self) -> Option<String> {
        let token = self.token.expose_secret().clone();
        self.token = Secret::new(None);
        token
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}:{}/ws", self.address, self.port)
    }
}

pub struct RtcConfigBuilder {
    pub address: String,
    pub port: u16,
    pub display_name: String,
    pub history_url: Option<String>,
    pub token: Secret<Option<String>>,
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for RtcConfigBuilder {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            display_name: Default::default(),
            history_url: None,
            token: Secret::new(None),
            ice_servers: default_ice_servers(),
        }
    }
}

impl RtcConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> RtcConfig {
        RtcConfig {
            address: self.address,
            port: self.port,
            display_name: self.display_name,
            history_url: self.history_url,
            token: self.token,
            ice_servers: self.ice_servers,
        }
    }

    pub fn address<S: AsRef<str>>(mut self, address: S) -> Self {
        self.address = address.as_ref().to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn display_name<S: AsRef<str>>(mut self, display_name: S) -> Self {
        self.display_name = display_name.as_ref().to_string();
        self
    }

    pub fn history_url<S: AsRef<str>>(mut self, url: S) -> Self {
        self.history_url = Some(url.as_ref().trim_end_matches('/').to_string());
        self
    }

    pub fn token<S: AsRef<str>>(mut self, token: S) -> Self {
        self.token = Secret::new(Some(token.as_ref().to_string()));
        self
    }

    pub fn ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }
}
