//! WebRTC configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default RTP MTU used by the packetizer
pub const DEFAULT_MTU: usize = 1200;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// Video codec names in preference order ("vp8", "h264", ...)
    pub video_codecs: Vec<String>,
    /// Maximum RTP packet size
    pub mtu: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            video_codecs: vec!["vp8".to_string(), "h264".to_string()],
            mtu: DEFAULT_MTU,
        }
    }
}

impl WebRtcConfig {
    /// ICE servers for the peer connection configuration
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// Default timeout for WHIP HTTP requests
pub const DEFAULT_WHIP_TIMEOUT_SECS: u64 = 10;

/// WHIP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhipConfig {
    /// Endpoint URL receiving the SDP offer
    pub endpoint: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            insecure: false,
            timeout_secs: DEFAULT_WHIP_TIMEOUT_SECS,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs; several allow fallback between UDP and TCP
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}
