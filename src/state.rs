use std::sync::Arc;

use crate::config::AppConfig;
use crate::webrtc::WebRtcSessionManager;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration loaded at startup
    pub config: AppConfig,
    /// One session per connected signaling client
    pub sessions: Arc<WebRtcSessionManager>,
}

impl AppState {
    pub fn new(config: AppConfig, sessions: Arc<WebRtcSessionManager>) -> Arc<Self> {
        Arc::new(Self { config, sessions })
    }
}
