use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::state::AppState;
use crate::webrtc::config::IceServer;
use crate::webrtc::mdns::{mdns_mode, mdns_mode_label};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
    pub mdns_mode: &'static str,
}

/// ICE servers used when a client's `request-offer` names none
pub async fn ice_servers(State(state): State<Arc<AppState>>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.webrtc.ice_servers(),
        mdns_mode: mdns_mode_label(mdns_mode()),
    })
}

#[derive(Serialize)]
pub struct WebRtcSessionInfo {
    pub client_id: u64,
    pub connected: bool,
    pub age_secs: u64,
}

#[derive(Serialize)]
pub struct WebRtcStatus {
    pub session_count: usize,
    pub sessions: Vec<WebRtcSessionInfo>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<WebRtcStatus> {
    let sessions = state.sessions.list_sessions().await;
    Json(WebRtcStatus {
        session_count: sessions.len(),
        sessions: sessions
            .into_iter()
            .map(|s| WebRtcSessionInfo {
                client_id: s.client_id,
                connected: s.connected,
                age_secs: s.created_at.elapsed().as_secs(),
            })
            .collect(),
    })
}

#[derive(Serialize)]
pub struct CloseSessionResponse {
    pub success: bool,
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<u64>,
) -> Result<Json<CloseSessionResponse>> {
    state.sessions.close_session(client_id).await?;
    Ok(Json(CloseSessionResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::config::AppConfig;
    use crate::error::AppError;
    use crate::webrtc::testing::{MockEngine, RecordingObserverFactory};
    use crate::webrtc::WebRtcSessionManager;

    fn state() -> Arc<AppState> {
        let config = AppConfig::default();
        let sessions = WebRtcSessionManager::new(
            config.webrtc.clone(),
            Arc::new(MockEngine::new()),
            Arc::new(RecordingObserverFactory::default()),
        );
        AppState::new(config, sessions)
    }

    #[tokio::test]
    async fn test_list_and_close_sessions() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = state.sessions.register_client(tx).await.unwrap();

        let Json(status) = list_sessions(State(state.clone())).await;
        assert_eq!(status.session_count, 1);
        assert_eq!(status.sessions[0].client_id, id);
        assert!(!status.sessions[0].connected);

        close_session(State(state.clone()), Path(id)).await.unwrap();
        assert!(matches!(
            close_session(State(state.clone()), Path(id)).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ice_servers_default_to_stun() {
        let Json(response) = ice_servers(State(state())).await;
        assert!(!response.ice_servers.is_empty());
        assert!(response.ice_servers[0].urls[0].starts_with("stun:"));
    }
}
