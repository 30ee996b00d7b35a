//! Signaling WebSocket
//!
//! Each socket at `/ws` is one client. Text frames carry JSON signaling
//! envelopes; envelopes produced by the client's session are written back as
//! text frames. Closing the socket tears the session down, and a session that
//! closes itself ends the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::signaling::DeviceMessage;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();

    let client_id = match state.sessions.register_client(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting signaling client: {}", e);
            if let Ok(text) = encode_message(&DeviceMessage::error(e.to_string())) {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!("Signaling client {} connected", client_id);

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(state.config.web.heartbeat_secs.max(1)));

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match parse_envelope(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Client {} sent invalid frame: {}", client_id, e);
                                if let Ok(text) = encode_message(&DeviceMessage::error(e.to_string())) {
                                    if sender.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                continue;
                            }
                        };
                        if state.sessions.handle_message(client_id, envelope).await.is_err() {
                            debug!("Client {} session is gone", client_id);
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Client {} sent a binary signaling frame, ignoring", client_id);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling client {} disconnected", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }

            message = outbound.recv() => {
                let Some(message) = message else {
                    // Session was torn down
                    break;
                };
                match encode_message(&message) {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            warn!("Failed to send to client {}, disconnecting", client_id);
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling message: {}", e),
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    if let Err(e) = state.sessions.close_session(client_id).await {
        debug!("Client {} already closed: {}", client_id, e);
    }
    info!("Signaling handler for client {} exiting", client_id);
}

/// A signaling frame must be a JSON object
fn parse_envelope(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(AppError::BadRequest(
            "Signaling message must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn encode_message(message: &DeviceMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
