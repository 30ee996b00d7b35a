//! WebRTC session management

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::client_handler::{ClientHandler, ConnectionChange};
use super::config::WebRtcConfig;
use super::engine::{LocalTrack, PeerConnectionBuilder};
use super::signaling::DeviceMessage;
use super::video_track::ClientVideoTrack;
use crate::error::{AppError, Result};
use crate::observer::ConnectionObserverFactory;

/// Maximum concurrent WebRTC sessions
pub const MAX_SESSIONS: usize = 8;

/// WebRTC session info
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: u64,
    pub created_at: Instant,
    pub connected: bool,
}

struct SessionEntry {
    handler: Arc<ClientHandler>,
    created_at: Instant,
    connected: bool,
}

/// Device tracks offered to every client
#[derive(Default)]
struct DeviceTracks {
    displays: Vec<(String, LocalTrack)>,
    audio: Vec<(String, LocalTrack)>,
}

/// WebRTC session manager
///
/// Owns one [`ClientHandler`] per client. Handlers report their connection
/// going down over a channel; a reaper task removes them and shuts them down
/// from its own task.
pub struct WebRtcSessionManager {
    config: WebRtcConfig,
    builder: Arc<dyn PeerConnectionBuilder>,
    observers: Arc<dyn ConnectionObserverFactory>,
    sessions: RwLock<HashMap<u64, SessionEntry>>,
    tracks: RwLock<DeviceTracks>,
    changes: mpsc::UnboundedSender<ConnectionChange>,
    next_client_id: AtomicU64,
}

impl WebRtcSessionManager {
    /// Create a new session manager and start its reaper
    pub fn new(
        config: WebRtcConfig,
        builder: Arc<dyn PeerConnectionBuilder>,
        observers: Arc<dyn ConnectionObserverFactory>,
    ) -> Arc<Self> {
        let (changes, changes_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            builder,
            observers,
            sessions: RwLock::new(HashMap::new()),
            tracks: RwLock::new(DeviceTracks::default()),
            changes,
            next_client_id: AtomicU64::new(1),
        });

        tokio::spawn(Self::reap(Arc::downgrade(&manager), changes_rx));
        manager
    }

    async fn reap(manager: Weak<Self>, mut changes: mpsc::UnboundedReceiver<ConnectionChange>) {
        while let Some(change) = changes.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };

            if change.connected {
                if let Some(entry) = manager.sessions.write().await.get_mut(&change.client_id) {
                    entry.connected = true;
                }
                info!("WebRTC client {} connected", change.client_id);
            } else if let Err(e) = manager.close_session(change.client_id).await {
                debug!("Reaper: {}", e);
            }
        }
        debug!("WebRTC session reaper stopped");
    }

    /// Register a new client whose outbound envelopes go to `outbound`
    ///
    /// The client receives every display and audio track registered so far.
    pub async fn register_client(
        &self,
        outbound: mpsc::UnboundedSender<DeviceMessage>,
    ) -> Result<u64> {
        if self.sessions.read().await.len() >= MAX_SESSIONS {
            return Err(AppError::WebRtcError(format!(
                "Maximum sessions ({}) reached",
                MAX_SESSIONS
            )));
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(ClientHandler::new(
            client_id,
            self.observers.create(client_id),
            self.builder.clone(),
            self.config.clone(),
            outbound,
            self.changes.clone(),
        ));

        {
            let tracks = self.tracks.read().await;
            for (label, track) in &tracks.displays {
                handler.add_display(label, track.clone()).await;
            }
            for (label, track) in &tracks.audio {
                handler.add_audio(label, track.clone()).await;
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            drop(sessions);
            handler.shutdown().await;
            return Err(AppError::WebRtcError(format!(
                "Maximum sessions ({}) reached",
                MAX_SESSIONS
            )));
        }
        sessions.insert(
            client_id,
            SessionEntry {
                handler,
                created_at: Instant::now(),
                connected: false,
            },
        );

        info!("WebRTC client registered: {}", client_id);
        Ok(client_id)
    }

    async fn handler(&self, client_id: u64) -> Result<Arc<ClientHandler>> {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", client_id)))
    }

    /// Route a signaling envelope to the client's session
    pub async fn handle_message(&self, client_id: u64, message: Value) -> Result<()> {
        self.handler(client_id).await?.handle_message(message);
        Ok(())
    }

    /// Camera video sent by the client
    pub async fn camera_stream(&self, client_id: u64) -> Result<Arc<ClientVideoTrack>> {
        Ok(self.handler(client_id).await?.camera_stream())
    }

    /// Close a session and release its engine connection
    pub async fn close_session(&self, client_id: u64) -> Result<()> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(&client_id)
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", client_id)))?;

        entry.handler.shutdown().await;
        info!("WebRTC session closed: {}", client_id);
        Ok(())
    }

    /// Offer a display track to every current and future client
    pub async fn add_display(&self, label: &str, track: LocalTrack) -> Result<()> {
        {
            let mut tracks = self.tracks.write().await;
            if tracks.displays.iter().any(|(l, _)| l == label) {
                return Err(AppError::BadRequest(format!(
                    "Display already registered: {}",
                    label
                )));
            }
            tracks.displays.push((label.to_string(), track.clone()));
        }

        for handler in self.handlers().await {
            if !handler.add_display(label, track.clone()).await {
                warn!(
                    "Failed to add display {} to client {}",
                    label,
                    handler.client_id()
                );
            }
        }
        Ok(())
    }

    pub async fn remove_display(&self, label: &str) -> Result<()> {
        {
            let mut tracks = self.tracks.write().await;
            let before = tracks.displays.len();
            tracks.displays.retain(|(l, _)| l != label);
            if tracks.displays.len() == before {
                return Err(AppError::NotFound(format!("Display not found: {}", label)));
            }
        }

        for handler in self.handlers().await {
            if !handler.remove_display(label).await {
                warn!(
                    "Failed to remove display {} from client {}",
                    label,
                    handler.client_id()
                );
            }
        }
        Ok(())
    }

    pub async fn add_audio(&self, label: &str, track: LocalTrack) -> Result<()> {
        self.tracks
            .write()
            .await
            .audio
            .push((label.to_string(), track.clone()));

        for handler in self.handlers().await {
            if !handler.add_audio(label, track.clone()).await {
                warn!(
                    "Failed to add audio {} to client {}",
                    label,
                    handler.client_id()
                );
            }
        }
        Ok(())
    }

    async fn handlers(&self) -> Vec<Arc<ClientHandler>> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| entry.handler.clone())
            .collect()
    }

    /// Get session info
    pub async fn get_session(&self, client_id: u64) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(&client_id)
            .map(|entry| SessionInfo {
                client_id,
                created_at: entry.created_at,
                connected: entry.connected,
            })
    }

    /// List all sessions
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                client_id: *id,
                created_at: entry.created_at,
                connected: entry.connected,
            })
            .collect();
        list.sort_by_key(|info| info.client_id);
        list
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close all sessions
    pub async fn close_all(&self) {
        let entries: Vec<(u64, SessionEntry)> = self.sessions.write().await.drain().collect();
        for (client_id, entry) in entries {
            entry.handler.shutdown().await;
            debug!("Closed WebRTC session {}", client_id);
        }
    }
}
