use serde::{Deserialize, Serialize};

pub use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling server settings
    pub web: WebConfig,
    /// Peer connection and data channel settings
    pub webrtc: WebRtcConfig,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Interval between WebSocket keepalive pings
    pub heartbeat_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
            heartbeat_secs: 30,
        }
    }
}
