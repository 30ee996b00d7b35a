//! WebRTC configuration

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Default start bitrate hint applied to every new peer connection (2 Mbps)
pub const DEFAULT_START_BITRATE_BPS: u32 = 2_000_000;

/// SCTP closes a data channel once its send buffer reaches 16 MiB; stay
/// one MiB below that.
pub const DEFAULT_MAX_BUFFERED_AMOUNT: usize = 15 * 1024 * 1024;

/// Largest camera capture accepted before the pending frame is discarded
pub const DEFAULT_MAX_CAMERA_CAPTURE_BYTES: usize = 32 * 1024 * 1024;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs used when the client does not send its own list
    pub stun_servers: Vec<String>,
    /// TURN servers used when the client does not send its own list
    pub turn_servers: Vec<IceServer>,
    /// Start bitrate hint in bits per second
    pub start_bitrate_bps: u32,
    /// Outbound buffer limit for passthrough channels, in bytes
    pub max_buffered_amount: usize,
    /// Camera capture size cap, in bytes
    pub max_camera_capture_bytes: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            start_bitrate_bps: DEFAULT_START_BITRATE_BPS,
            max_buffered_amount: DEFAULT_MAX_BUFFERED_AMOUNT,
            max_camera_capture_bytes: DEFAULT_MAX_CAMERA_CAPTURE_BYTES,
        }
    }
}

impl WebRtcConfig {
    /// Configured ICE servers, STUN first
    ///
    /// TURN entries without credentials are skipped since the engine would
    /// reject them at build time.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .map(|url| IceServer::new(url.clone()))
            .collect();

        for turn in &self.turn_servers {
            if turn.username.is_none() || turn.credential.is_none() {
                warn!(
                    "Skipping TURN server {:?}: username and credential are required",
                    turn.urls
                );
                continue;
            }
            servers.push(turn.clone());
        }

        servers
    }
}

/// ICE server entry as carried in request-offer envelopes and configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One URL or a list of URLs
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}
