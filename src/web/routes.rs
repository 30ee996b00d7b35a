use axum::{
    routing::{any, delete, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/webrtc/ice-servers", get(handlers::ice_servers))
        .route("/webrtc/sessions", get(handlers::list_sessions))
        .route("/webrtc/sessions/:id", delete(handlers::close_session));

    Router::new()
        // Signaling endpoint, one socket per client
        .route("/ws", any(ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
