//! Per-client session
//!
//! A [`ClientHandler`] owns everything that belongs to one client: the engine
//! connection, signaling state, display and audio tracks, and the data
//! channel handlers. All of it lives in a single task; signaling messages,
//! device calls, engine notifications and engine operation completions are
//! all serialized through it.
//!
//! Engine operations (descriptions, candidates) are pushed onto an
//! [`OperationsChain`] and report back as completions, so the session never
//! waits on the engine while holding up other messages.
//!
//! Closing is two-phase. [`ClientHandler::close`] and terminal connection
//! states only report the connection as down to the owner; the owner then
//! calls [`ClientHandler::shutdown`], which tears down channels and the
//! engine connection from outside any engine callback.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::config::{IceServer, WebRtcConfig};
use super::engine::{
    BitrateSettings, LocalTrack, PeerConnection, PeerConnectionBuilder, PeerEvent, PeerEventSink,
    RemoteTrack, SenderId,
};
use super::operations::OperationsChain;
use super::signaling::{
    ClientMessage, ConnectionState, DeviceMessage, IceCandidate, SdpType, SessionDescription,
};
use super::video_track::ClientVideoTrack;
use crate::channels::{
    ChannelHandler, ChannelKind, ChannelLimits, ChannelRegistration, DEVICE_CONTROL_LABEL,
};
use crate::error::{AppError, Result};
use crate::observer::ConnectionObserver;

/// Connection up/down report sent to the session owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    pub client_id: u64,
    pub connected: bool,
}

enum Command {
    Signaling(Value),
    AddDisplay {
        label: String,
        track: LocalTrack,
        reply: oneshot::Sender<bool>,
    },
    RemoveDisplay {
        label: String,
        reply: oneshot::Sender<bool>,
    },
    AddAudio {
        label: String,
        track: LocalTrack,
        reply: oneshot::Sender<bool>,
    },
    DescriptionCreated {
        sdp_type: SdpType,
        result: Result<SessionDescription>,
    },
    LocalDescriptionSet {
        sdp_type: SdpType,
        result: Result<()>,
    },
    RemoteDescriptionSet {
        sdp_type: SdpType,
        result: Result<()>,
    },
    CandidateAdded(Result<()>),
    Close,
    Shutdown(oneshot::Sender<()>),
}

/// Offer/answer exchange in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Idle,
    /// Device offer requested from the engine
    CreatingOffer,
    /// Device offer sent, waiting for the client's answer
    AwaitingAnswer,
    /// Client offer being applied and answered
    Answering,
}

pub struct ClientHandler {
    client_id: u64,
    commands: mpsc::UnboundedSender<Command>,
    camera_track: Arc<ClientVideoTrack>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandler {
    /// Create the session task for `client_id`
    ///
    /// No engine connection exists until the client sends `request-offer`.
    pub fn new(
        client_id: u64,
        observer: Arc<dyn ConnectionObserver>,
        builder: Arc<dyn PeerConnectionBuilder>,
        config: WebRtcConfig,
        outbound: mpsc::UnboundedSender<DeviceMessage>,
        connection_changes: mpsc::UnboundedSender<ConnectionChange>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (event_sink, events_rx) = PeerEventSink::channel();
        let camera_track = Arc::new(ClientVideoTrack::new());

        let session = Session {
            client_id,
            limits: ChannelLimits::from(&config),
            config,
            observer,
            builder,
            outbound,
            connection_changes,
            commands: commands.downgrade(),
            event_sink,
            camera_track: camera_track.clone(),
            peer: None,
            operations: OperationsChain::spawn(client_id),
            negotiation: Negotiation::Idle,
            renegotiation_pending: false,
            remote_description_added: false,
            pending_ice_candidates: VecDeque::new(),
            closed: false,
            displays: HashMap::new(),
            audio_streams: Vec::new(),
            control: None,
            channels: HashMap::new(),
            generic_channels: Vec::new(),
        };

        let task = tokio::spawn(session.run(commands_rx, events_rx));

        Self {
            client_id,
            commands,
            camera_track,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Queue a signaling envelope from the client
    pub fn handle_message(&self, message: Value) {
        self.post(Command::Signaling(message));
    }

    /// Expose `track` to the client under `label`
    ///
    /// Before the engine connection exists the track is only recorded and is
    /// added when the connection is built. Labels must be unique.
    pub async fn add_display(&self, label: &str, track: LocalTrack) -> bool {
        let (reply, rx) = oneshot::channel();
        self.post(Command::AddDisplay {
            label: label.to_string(),
            track,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Returns `false` if no display has that label
    pub async fn remove_display(&self, label: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.post(Command::RemoveDisplay {
            label: label.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    pub async fn add_audio(&self, label: &str, track: LocalTrack) -> bool {
        let (reply, rx) = oneshot::channel();
        self.post(Command::AddAudio {
            label: label.to_string(),
            track,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Handle for attaching a sink to the client's camera video
    pub fn camera_stream(&self) -> Arc<ClientVideoTrack> {
        self.camera_track.clone()
    }

    /// Request closure; the owner is told the connection is down
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Release channels and close the engine connection, then stop the task
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        self.post(Command::Shutdown(done));
        let _ = rx.await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Client {} session already stopped", self.client_id);
        }
    }
}

struct DisplayTrack {
    track: LocalTrack,
    sender: Option<SenderId>,
}

struct Session {
    client_id: u64,
    config: WebRtcConfig,
    limits: ChannelLimits,
    observer: Arc<dyn ConnectionObserver>,
    builder: Arc<dyn PeerConnectionBuilder>,
    outbound: mpsc::UnboundedSender<DeviceMessage>,
    connection_changes: mpsc::UnboundedSender<ConnectionChange>,
    /// Completions only; must not keep the session alive
    commands: mpsc::WeakUnboundedSender<Command>,
    event_sink: PeerEventSink,
    camera_track: Arc<ClientVideoTrack>,

    peer: Option<Arc<dyn PeerConnection>>,
    operations: OperationsChain,
    negotiation: Negotiation,
    renegotiation_pending: bool,
    remote_description_added: bool,
    pending_ice_candidates: VecDeque<IceCandidate>,
    closed: bool,

    displays: HashMap<String, DisplayTrack>,
    audio_streams: Vec<(LocalTrack, String)>,

    control: Option<ChannelRegistration>,
    channels: HashMap<ChannelKind, ChannelRegistration>,
    generic_channels: Vec<ChannelRegistration>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        debug!("Client {} session started", self.client_id);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            return;
                        }
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Signaling(message) => self.handle_signaling(message).await,
            Command::AddDisplay {
                label,
                track,
                reply,
            } => {
                let _ = reply.send(self.add_display(label, track).await);
            }
            Command::RemoveDisplay { label, reply } => {
                let _ = reply.send(self.remove_display(&label).await);
            }
            Command::AddAudio {
                label,
                track,
                reply,
            } => {
                let _ = reply.send(self.add_audio(label, track).await);
            }
            Command::DescriptionCreated { sdp_type, result } => {
                self.on_description_created(sdp_type, result)
            }
            Command::LocalDescriptionSet { sdp_type, result } => {
                self.on_local_description_set(sdp_type, result)
            }
            Command::RemoteDescriptionSet { sdp_type, result } => {
                self.on_remote_description_set(sdp_type, result)
            }
            Command::CandidateAdded(result) => {
                if let Err(e) = result {
                    if !self.closed {
                        self.reply_error(&e.to_string());
                    }
                }
            }
            Command::Close => self.close(),
            Command::Shutdown(done) => {
                self.teardown().await;
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // -- signaling -----------------------------------------------------------

    async fn handle_signaling(&mut self, message: Value) {
        if self.closed {
            debug!(
                "Client {} is closed, ignoring signaling message",
                self.client_id
            );
            return;
        }

        let message = match ClientMessage::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                self.reply_error(&e.to_string());
                return;
            }
        };
        trace!("Client {} sent {}", self.client_id, message.kind());

        match message {
            ClientMessage::RequestOffer { ice_servers } => self.on_request_offer(ice_servers).await,
            ClientMessage::Offer { sdp } => self.on_remote_offer(sdp),
            ClientMessage::Answer { sdp } => self.on_remote_answer(sdp),
            ClientMessage::IceCandidate(candidate) => self.on_remote_candidate(candidate),
            ClientMessage::Error { error } => {
                error!("Client {} reported an error: {}", self.client_id, error);
            }
        }
    }

    async fn on_request_offer(&mut self, ice_servers: Vec<IceServer>) {
        if self.peer.is_some() {
            self.reply_error("Peer connection already exists, offer already requested");
            return;
        }

        let ice_servers = if ice_servers.is_empty() {
            self.config.ice_servers()
        } else {
            ice_servers
        };

        match self.build_peer_connection(&ice_servers).await {
            Ok(peer) => {
                info!("Client {} peer connection created", self.client_id);
                self.peer = Some(peer);
            }
            Err(e) => {
                error!(
                    "Client {} failed to create peer connection: {}",
                    self.client_id, e
                );
                self.reply_error("Failed to create peer connection");
                return;
            }
        }

        self.start_offer();
    }

    async fn build_peer_connection(
        &mut self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = self.builder.build(self.event_sink.clone(), ice_servers).await?;

        match self.configure_peer_connection(&peer).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                for display in self.displays.values_mut() {
                    display.sender = None;
                }
                if let Err(close_err) = peer.close().await {
                    warn!(
                        "Client {} failed to close unusable peer connection: {}",
                        self.client_id, close_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Re-apply recorded tracks, set the start bitrate and create the
    /// device control channel
    async fn configure_peer_connection(&mut self, peer: &Arc<dyn PeerConnection>) -> Result<()> {
        for (label, display) in self.displays.iter_mut() {
            let sender = peer
                .add_track(display.track.clone(), std::slice::from_ref(label))
                .await?;
            display.sender = Some(sender);
        }
        for (track, label) in &self.audio_streams {
            peer.add_track(track.clone(), std::slice::from_ref(label))
                .await?;
        }

        // Engines start video encoders conservatively and drop the first
        // frames otherwise
        let bitrate = BitrateSettings {
            start_bitrate_bps: Some(self.config.start_bitrate_bps),
        };
        if let Err(e) = peer.set_bitrate(bitrate) {
            warn!("Client {} failed to set start bitrate: {}", self.client_id, e);
        }

        // The offering side must create at least one data channel for data
        // channels to be negotiated at all
        let control = peer
            .create_data_channel(DEVICE_CONTROL_LABEL)
            .await
            .map_err(|e| {
                AppError::PeerConnection(format!("Failed to create control data channel: {}", e))
            })?;
        self.control = Some(ChannelHandler::attach(
            ChannelKind::Control,
            control,
            self.observer.clone(),
            self.limits,
            self.client_id,
        ));

        Ok(())
    }

    fn start_offer(&mut self) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if self.negotiation != Negotiation::Idle {
            self.renegotiation_pending = true;
            return;
        }

        self.negotiation = Negotiation::CreatingOffer;
        self.renegotiation_pending = false;

        let done = self.commands.clone();
        self.operations.push(async move {
            let result = peer.create_offer().await;
            post(
                &done,
                Command::DescriptionCreated {
                    sdp_type: SdpType::Offer,
                    result,
                },
            );
        });
    }

    fn on_remote_offer(&mut self, sdp: String) {
        let Some(peer) = self.peer.clone() else {
            self.reply_error("Received an offer before requesting one");
            return;
        };
        if self.negotiation != Negotiation::Idle {
            self.reply_error("Negotiation already in progress");
            return;
        }
        self.negotiation = Negotiation::Answering;
        // Candidates for this offer wait until it has been applied
        self.remote_description_added = false;

        let done = self.commands.clone();
        self.operations.push(async move {
            let result = peer
                .set_remote_description(SessionDescription::offer(sdp))
                .await;
            post(
                &done,
                Command::RemoteDescriptionSet {
                    sdp_type: SdpType::Offer,
                    result,
                },
            );
        });
    }

    fn on_remote_answer(&mut self, sdp: String) {
        let Some(peer) = self.peer.clone() else {
            self.reply_error("Received an answer before requesting an offer");
            return;
        };
        if self.negotiation != Negotiation::AwaitingAnswer {
            warn!(
                "Client {} sent an answer while {:?}",
                self.client_id, self.negotiation
            );
        }

        let done = self.commands.clone();
        self.operations.push(async move {
            let result = peer
                .set_remote_description(SessionDescription::answer(sdp))
                .await;
            post(
                &done,
                Command::RemoteDescriptionSet {
                    sdp_type: SdpType::Answer,
                    result,
                },
            );
        });

        // Candidates only need the remote description to have been requested;
        // the chain applies them after it
        self.remote_description_added = true;
        self.add_pending_ice_candidates();
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_added {
            self.add_ice_candidate(candidate);
        } else {
            trace!(
                "Client {} buffering ICE candidate until remote description",
                self.client_id
            );
            self.pending_ice_candidates.push_back(candidate);
        }
    }

    fn add_pending_ice_candidates(&mut self) {
        while let Some(candidate) = self.pending_ice_candidates.pop_front() {
            self.add_ice_candidate(candidate);
        }
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let done = self.commands.clone();
        self.operations.push(async move {
            let result = peer.add_ice_candidate(candidate).await;
            post(&done, Command::CandidateAdded(result));
        });
    }

    fn on_description_created(&mut self, sdp_type: SdpType, result: Result<SessionDescription>) {
        if self.closed {
            return;
        }

        let desc = match result {
            Ok(desc) => desc,
            Err(e) => {
                self.reply_error(&format!("Failed to create {}: {}", sdp_type, e));
                self.close();
                return;
            }
        };
        let Some(peer) = self.peer.clone() else {
            return;
        };

        if sdp_type == SdpType::Offer {
            self.negotiation = Negotiation::AwaitingAnswer;
        }
        self.send(DeviceMessage::description(&desc));

        let done = self.commands.clone();
        self.operations.push(async move {
            let result = peer.set_local_description(desc).await;
            post(&done, Command::LocalDescriptionSet { sdp_type, result });
        });
    }

    fn on_local_description_set(&mut self, sdp_type: SdpType, result: Result<()>) {
        if self.closed {
            return;
        }

        if let Err(e) = result {
            // The engine rejected a description it generated itself
            error!(
                "Client {} failed to set local {}: {}",
                self.client_id, sdp_type, e
            );
            self.reply_error(&e.to_string());
            self.close();
            return;
        }

        if sdp_type == SdpType::Answer {
            self.finish_negotiation();
        }
    }

    fn on_remote_description_set(&mut self, sdp_type: SdpType, result: Result<()>) {
        if self.closed {
            return;
        }

        if let Err(e) = result {
            // A rejected remote description means the client can't be trusted
            self.reply_error(&format!("Failed to set remote {}: {}", sdp_type, e));
            self.close();
            return;
        }

        match sdp_type {
            SdpType::Offer => {
                self.remote_description_added = true;
                self.add_pending_ice_candidates();

                let Some(peer) = self.peer.clone() else {
                    return;
                };
                let done = self.commands.clone();
                self.operations.push(async move {
                    let result = peer.create_answer().await;
                    post(
                        &done,
                        Command::DescriptionCreated {
                            sdp_type: SdpType::Answer,
                            result,
                        },
                    );
                });
            }
            SdpType::Answer => {
                if self.negotiation == Negotiation::AwaitingAnswer {
                    self.finish_negotiation();
                }
            }
        }
    }

    fn finish_negotiation(&mut self) {
        self.negotiation = Negotiation::Idle;
        if self.renegotiation_pending {
            debug!("Client {} running deferred renegotiation", self.client_id);
            self.start_offer();
        }
    }

    // -- engine notifications ------------------------------------------------

    fn handle_event(&mut self, event: PeerEvent) {
        if self.closed {
            trace!("Client {} is closed, dropping {:?}", self.client_id, event);
            return;
        }

        match event {
            PeerEvent::ConnectionStateChanged(state) => self.on_connection_change(state),
            PeerEvent::IceCandidate(candidate) => {
                self.send(DeviceMessage::IceCandidate(candidate));
            }
            PeerEvent::IceGatheringChanged(state) => {
                debug!("Client {} ICE gathering {}", self.client_id, state);
            }
            PeerEvent::SignalingChanged(state) => {
                debug!("Client {} signaling state {}", self.client_id, state);
            }
            PeerEvent::DataChannel(channel) => {
                let kind = ChannelKind::from_label(channel.label());
                info!(
                    "Client {} opened data channel '{}'",
                    self.client_id,
                    channel.label()
                );

                if kind == ChannelKind::Generic {
                    self.generic_channels.push(ChannelHandler::attach(
                        kind,
                        channel,
                        self.observer.clone(),
                        self.limits,
                        self.client_id,
                    ));
                    return;
                }

                // The old handler must stop receiving before the new one starts
                if self.channels.remove(&kind).is_some() {
                    warn!(
                        "Client {} replaced existing {:?} channel",
                        self.client_id, kind
                    );
                }
                let registration = ChannelHandler::attach(
                    kind,
                    channel,
                    self.observer.clone(),
                    self.limits,
                    self.client_id,
                );
                self.channels.insert(kind, registration);
            }
            PeerEvent::TrackAdded(RemoteTrack::Video(track)) => {
                self.camera_track.set_video_track(&track);
            }
            PeerEvent::TrackRemoved(RemoteTrack::Video(track)) => {
                self.camera_track.unset_video_track(&track);
            }
            PeerEvent::TrackAdded(track) | PeerEvent::TrackRemoved(track) => {
                debug!("Client {} ignoring {:?} track", self.client_id, track);
            }
            PeerEvent::RenegotiationNeeded => match self.negotiation {
                // The offer being created already reflects the change
                Negotiation::CreatingOffer => {}
                _ => self.start_offer(),
            },
        }
    }

    fn on_connection_change(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::New | ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                info!("Client {}: WebRTC connected", self.client_id);
                self.observer.on_connected();
                self.report(true);
            }
            ConnectionState::Failed => {
                error!("Client {}: connection failed", self.client_id);
                self.close();
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                info!("Client {}: connection {}", self.client_id, state);
                self.close();
            }
        }
    }

    // -- displays and audio ----------------------------------------------------

    async fn add_display(&mut self, label: String, track: LocalTrack) -> bool {
        if self.displays.contains_key(&label) {
            warn!(
                "Client {} already has a display labeled {}",
                self.client_id, label
            );
            return false;
        }

        let sender = match &self.peer {
            Some(peer) => match peer.add_track(track.clone(), std::slice::from_ref(&label)).await {
                Ok(sender) => Some(sender),
                Err(e) => {
                    error!(
                        "Client {} failed to add display {}: {}",
                        self.client_id, label, e
                    );
                    return false;
                }
            },
            None => None,
        };

        self.displays.insert(label, DisplayTrack { track, sender });
        true
    }

    async fn remove_display(&mut self, label: &str) -> bool {
        let Some(display) = self.displays.get(label) else {
            return false;
        };

        if let (Some(peer), Some(sender)) = (&self.peer, display.sender) {
            if let Err(e) = peer.remove_track(sender).await {
                error!(
                    "Client {} failed to remove display {}: {}",
                    self.client_id, label, e
                );
                return false;
            }
        }

        self.displays.remove(label);
        true
    }

    async fn add_audio(&mut self, label: String, track: LocalTrack) -> bool {
        if let Some(peer) = &self.peer {
            if let Err(e) = peer
                .add_track(track.clone(), std::slice::from_ref(&label))
                .await
            {
                error!(
                    "Client {} failed to add audio {}: {}",
                    self.client_id, label, e
                );
                return false;
            }
        }

        self.audio_streams.push((track, label));
        true
    }

    // -- lifecycle -------------------------------------------------------------

    /// Report the connection down once; teardown is left to the owner
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.report(false);
    }

    async fn teardown(&mut self) {
        self.closed = true;
        self.control = None;
        self.channels.clear();
        self.generic_channels.clear();
        self.pending_ice_candidates.clear();

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!(
                    "Client {} failed to close peer connection: {}",
                    self.client_id, e
                );
            }
        }
        debug!("Client {} session torn down", self.client_id);
    }

    fn report(&self, connected: bool) {
        let _ = self.connection_changes.send(ConnectionChange {
            client_id: self.client_id,
            connected,
        });
    }

    fn send(&self, message: DeviceMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Client {} transport is gone", self.client_id);
        }
    }

    fn reply_error(&self, message: &str) {
        error!("Client {}: {}", self.client_id, message);
        self.send(DeviceMessage::error(message));
    }
}

fn post(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(commands) = commands.upgrade() {
        let _ = commands.send(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::channels::INPUT_CHANNEL_LABEL;
    use crate::webrtc::engine::{DataBuffer, DataChannelState, VideoTrack};
    use crate::webrtc::testing::{
        eventually, local_video_track, EngineCall, MockDataChannel, MockEngine, MockVideoTrack,
        ObservedEvent, RecordingObserver,
    };

    struct Harness {
        handler: ClientHandler,
        engine: MockEngine,
        observer: Arc<RecordingObserver>,
        outbound: mpsc::UnboundedReceiver<DeviceMessage>,
        changes: mpsc::UnboundedReceiver<ConnectionChange>,
    }

    impl Harness {
        fn new() -> Self {
            let engine = MockEngine::new();
            let observer = Arc::new(RecordingObserver::default());
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (change_tx, changes) = mpsc::unbounded_channel();
            let handler = ClientHandler::new(
                7,
                observer.clone(),
                Arc::new(engine.clone()),
                WebRtcConfig::default(),
                out_tx,
                change_tx,
            );
            Self {
                handler,
                engine,
                observer,
                outbound,
                changes,
            }
        }

        async fn next_message(&mut self) -> DeviceMessage {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound channel closed")
        }

        /// Wait until every command queued so far has been handled
        async fn sync(&self) {
            self.handler.remove_display("__sync__").await;
        }

        /// Run request-offer and return once the offer was sent
        async fn connect(&mut self) {
            self.handler
                .handle_message(json!({"type": "request-offer"}));
            match self.next_message().await {
                DeviceMessage::Offer { .. } => {}
                other => panic!("expected offer, got {:?}", other),
            }
            let engine = self.engine.clone();
            eventually(move || engine.count(&EngineCall::SetLocal(SdpType::Offer)) == 1).await;
        }

        /// Answer the outstanding offer and wait for the session to settle
        async fn answer(&self) {
            self.handler
                .handle_message(json!({"type": "answer", "sdp": "v=0 client-answer"}));
            let engine = self.engine.clone();
            eventually(move || engine.count(&EngineCall::SetRemote(SdpType::Answer)) >= 1).await;
            self.sync().await;
        }

        fn candidate(&self, n: u16) {
            self.handler.handle_message(json!({
                "type": "ice-candidate",
                "mid": "0",
                "mLineIndex": 0,
                "candidate": format!("candidate:{}", n),
            }));
        }

        fn candidate_calls(&self) -> Vec<String> {
            self.engine
                .calls()
                .into_iter()
                .filter_map(|c| match c {
                    EngineCall::AddIceCandidate(c) => Some(c),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_request_offer_builds_connection_and_sends_offer() {
        let mut h = Harness::new();
        h.handler.handle_message(json!({"type": "request-offer"}));

        assert_eq!(
            h.next_message().await,
            DeviceMessage::Offer {
                sdp: "v=0 mock-offer".to_string()
            }
        );
        let engine = h.engine.clone();
        eventually(move || engine.count(&EngineCall::SetLocal(SdpType::Offer)) == 1).await;

        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Build(WebRtcConfig::default().ice_servers()),
                EngineCall::SetBitrate(BitrateSettings {
                    start_bitrate_bps: Some(2_000_000),
                }),
                EngineCall::CreateDataChannel("device-control".to_string()),
                EngineCall::CreateOffer,
                EngineCall::SetLocal(SdpType::Offer),
            ]
        );
    }

    #[tokio::test]
    async fn test_request_offer_uses_client_ice_servers() {
        let mut h = Harness::new();
        h.handler.handle_message(json!({
            "type": "request-offer",
            "ice_servers": [{"urls": ["turn:turn.example.org"], "username": "u", "credential": "p"}]
        }));
        h.next_message().await;

        assert_eq!(
            h.engine.calls()[0],
            EngineCall::Build(vec![
                IceServer::new("turn:turn.example.org").with_credentials("u", "p")
            ])
        );
    }

    #[tokio::test]
    async fn test_second_request_offer_is_rejected() {
        let mut h = Harness::new();
        h.connect().await;

        h.handler.handle_message(json!({"type": "request-offer"}));
        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));

        let builds = h
            .engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Build(_)))
            .count();
        assert_eq!(builds, 1);
    }

    #[tokio::test]
    async fn test_build_failure_replies_error() {
        let mut h = Harness::new();
        h.engine.behavior(|b| b.fail_build = true);

        h.handler.handle_message(json!({"type": "request-offer"}));
        assert_eq!(
            h.next_message().await,
            DeviceMessage::error("Failed to create peer connection")
        );
        assert_eq!(h.engine.count(&EngineCall::CreateOffer), 0);
    }

    #[tokio::test]
    async fn test_control_channel_failure_closes_connection() {
        let mut h = Harness::new();
        h.engine.behavior(|b| b.fail_data_channel = true);

        h.handler.handle_message(json!({"type": "request-offer"}));
        assert_eq!(
            h.next_message().await,
            DeviceMessage::error("Failed to create peer connection")
        );
        assert_eq!(h.engine.count(&EngineCall::Close), 1);
        assert_eq!(h.engine.count(&EngineCall::CreateOffer), 0);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let mut h = Harness::new();
        h.connect().await;

        h.candidate(1);
        h.candidate(2);
        h.sync().await;
        assert!(h.candidate_calls().is_empty());

        h.handler
            .handle_message(json!({"type": "answer", "sdp": "v=0 client-answer"}));
        h.candidate(3);
        h.sync().await;

        let engine = h.engine.clone();
        eventually(move || {
            engine
                .calls()
                .iter()
                .filter(|c| matches!(c, EngineCall::AddIceCandidate(_)))
                .count()
                == 3
        })
        .await;

        let calls = h.engine.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == EngineCall::SetRemote(SdpType::Answer))
            .unwrap();
        assert_eq!(
            &calls[set_remote + 1..],
            &[
                EngineCall::AddIceCandidate("candidate:1".to_string()),
                EngineCall::AddIceCandidate("candidate:2".to_string()),
                EngineCall::AddIceCandidate("candidate:3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_answer_failure_still_flushes_then_closes() {
        let mut h = Harness::new();
        h.connect().await;
        h.engine.behavior(|b| b.fail_set_remote = true);

        h.candidate(1);
        h.handler
            .handle_message(json!({"type": "answer", "sdp": "v=0 bad"}));

        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));
        let change = h.changes.recv().await.unwrap();
        assert_eq!(
            change,
            ConnectionChange {
                client_id: 7,
                connected: false
            }
        );
        let engine = h.engine.clone();
        eventually(move || engine.count(&EngineCall::AddIceCandidate("candidate:1".into())) == 1)
            .await;
    }

    #[tokio::test]
    async fn test_candidate_failure_is_not_fatal() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;
        h.engine.behavior(|b| b.fail_add_candidate = true);

        h.candidate(1);
        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));

        h.sync().await;
        assert!(h.changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_offer_is_answered() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;

        h.handler
            .handle_message(json!({"type": "offer", "sdp": "v=0 client-offer"}));
        assert_eq!(
            h.next_message().await,
            DeviceMessage::Answer {
                sdp: "v=0 mock-answer".to_string()
            }
        );
        let engine = h.engine.clone();
        eventually(move || engine.count(&EngineCall::SetLocal(SdpType::Answer)) == 1).await;

        let calls = h.engine.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == EngineCall::SetRemote(SdpType::Offer))
            .unwrap();
        assert_eq!(calls[set_remote + 1], EngineCall::CreateAnswer);
    }

    #[tokio::test]
    async fn test_rejected_client_offer_closes_without_answer() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;

        h.engine.behavior(|b| b.fail_set_remote = true);
        h.handler
            .handle_message(json!({"type": "offer", "sdp": "v=0 bad"}));

        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));
        assert_eq!(h.changes.recv().await.unwrap().connected, false);
        assert_eq!(h.engine.count(&EngineCall::CreateAnswer), 0);
    }

    #[tokio::test]
    async fn test_offer_while_negotiating_is_rejected() {
        let mut h = Harness::new();
        h.connect().await;

        h.handler
            .handle_message(json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(
            h.next_message().await,
            DeviceMessage::error("Negotiation already in progress")
        );
    }

    #[tokio::test]
    async fn test_renegotiation_after_connect() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;

        h.engine.emit(PeerEvent::RenegotiationNeeded);
        assert!(matches!(h.next_message().await, DeviceMessage::Offer { .. }));
        assert_eq!(h.engine.count(&EngineCall::CreateOffer), 2);
        assert_eq!(
            h.engine
                .calls()
                .iter()
                .filter(|c| matches!(c, EngineCall::Build(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_renegotiation_deferred_while_awaiting_answer() {
        let mut h = Harness::new();
        h.connect().await;

        h.engine.emit(PeerEvent::RenegotiationNeeded);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.sync().await;
        assert_eq!(h.engine.count(&EngineCall::CreateOffer), 1);
        assert!(h.outbound.try_recv().is_err());

        h.answer().await;
        assert!(matches!(h.next_message().await, DeviceMessage::Offer { .. }));
        let engine = h.engine.clone();
        eventually(move || engine.count(&EngineCall::SetLocal(SdpType::Offer)) == 2).await;

        let calls = h.engine.calls();
        let set_answer = calls
            .iter()
            .position(|c| *c == EngineCall::SetRemote(SdpType::Answer))
            .unwrap();
        let second_offer = calls
            .iter()
            .rposition(|c| *c == EngineCall::CreateOffer)
            .unwrap();
        assert!(second_offer > set_answer);
        assert_eq!(h.engine.count(&EngineCall::CreateOffer), 2);
    }

    #[tokio::test]
    async fn test_client_offer_candidates_applied_after_offer() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;

        h.handler
            .handle_message(json!({"type": "offer", "sdp": "v=0 client-offer"}));
        h.candidate(5);
        h.candidate(6);
        assert!(matches!(h.next_message().await, DeviceMessage::Answer { .. }));
        let engine = h.engine.clone();
        eventually(move || engine.count(&EngineCall::SetLocal(SdpType::Answer)) == 1).await;

        let calls = h.engine.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == EngineCall::SetRemote(SdpType::Offer))
            .unwrap();
        assert_eq!(
            &calls[set_remote + 1..set_remote + 4],
            &[
                EngineCall::AddIceCandidate("candidate:5".to_string()),
                EngineCall::AddIceCandidate("candidate:6".to_string()),
                EngineCall::CreateAnswer,
            ]
        );
    }

    #[tokio::test]
    async fn test_client_offer_candidates_dropped_when_offer_rejected() {
        let mut h = Harness::new();
        h.connect().await;
        h.answer().await;

        h.engine.behavior(|b| b.fail_set_remote = true);
        h.handler
            .handle_message(json!({"type": "offer", "sdp": "v=0 bad"}));
        h.candidate(5);

        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));
        assert_eq!(h.changes.recv().await.unwrap().connected, false);
        h.sync().await;
        assert!(h.candidate_calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_reply_error() {
        let mut h = Harness::new();

        h.handler.handle_message(json!({"sdp": "v=0"}));
        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));

        h.handler.handle_message(json!({"type": "bye"}));
        assert!(matches!(h.next_message().await, DeviceMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_only_logged() {
        let mut h = Harness::new();
        h.handler
            .handle_message(json!({"type": "error", "error": "camera unavailable"}));
        h.sync().await;

        assert!(h.outbound.try_recv().is_err());
        assert!(h.changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_notifies_observer_and_owner() {
        let mut h = Harness::new();
        h.connect().await;

        h.engine
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert_eq!(
            h.changes.recv().await.unwrap(),
            ConnectionChange {
                client_id: 7,
                connected: true
            }
        );
        assert!(h.observer.events().contains(&ObservedEvent::Connected));
    }

    #[tokio::test]
    async fn test_close_reported_once() {
        let mut h = Harness::new();
        h.connect().await;

        h.engine
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        h.engine
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Failed));
        h.handler.close();
        h.sync().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.changes.recv().await.unwrap().connected, false);
        assert!(h.changes.try_recv().is_err());
        // Closing never tears the engine down by itself
        assert_eq!(h.engine.count(&EngineCall::Close), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_channels_and_closes_engine() {
        let mut h = Harness::new();
        h.connect().await;
        let control = h.engine.created_channel("device-control").unwrap();
        assert!(control.has_observer());

        h.handler.shutdown().await;

        assert!(!control.has_observer());
        assert_eq!(h.engine.count(&EngineCall::Close), 1);
    }

    #[tokio::test]
    async fn test_control_channel_open_reaches_observer() {
        let mut h = Harness::new();
        h.connect().await;

        let control = h.engine.created_channel("device-control").unwrap();
        control.set_state(DataChannelState::Open);

        assert_eq!(h.observer.events(), vec![ObservedEvent::ControlOpen]);
        assert!(h.observer.control_sender().is_some());
    }

    #[tokio::test]
    async fn test_inbound_channels_are_routed_by_label() {
        let mut h = Harness::new();
        h.connect().await;

        let input = Arc::new(MockDataChannel::new(INPUT_CHANNEL_LABEL));
        let custom = Arc::new(MockDataChannel::new("custom-channel"));
        h.engine.emit(PeerEvent::DataChannel(input.clone()));
        h.engine.emit(PeerEvent::DataChannel(custom.clone()));
        let (i, c) = (input.clone(), custom.clone());
        eventually(move || i.has_observer() && c.has_observer()).await;

        input.deliver(DataBuffer::text(
            br#"{"type":"keyboard","event_type":"keydown","keycode":"KeyA"}"#.to_vec(),
        ));
        assert_eq!(
            h.observer.events(),
            vec![ObservedEvent::Keyboard {
                code: 30,
                down: true
            }]
        );

        // A second channel with the same label replaces the first
        let replacement = Arc::new(MockDataChannel::new(INPUT_CHANNEL_LABEL));
        h.engine.emit(PeerEvent::DataChannel(replacement.clone()));
        let r = replacement.clone();
        eventually(move || r.has_observer()).await;
        assert!(!input.has_observer());
    }

    #[tokio::test]
    async fn test_displays_recorded_then_applied_on_build() {
        let mut h = Harness::new();

        assert!(h.handler.add_display("display_0", local_video_track("v0")).await);
        assert!(!h.handler.add_display("display_0", local_video_track("v1")).await);
        assert!(h.handler.add_audio("audio", local_video_track("a0")).await);
        assert!(h.engine.calls().is_empty());

        h.connect().await;
        let calls = h.engine.calls();
        assert_eq!(
            calls[1],
            EngineCall::AddTrack {
                track_id: "v0".to_string(),
                stream_ids: vec!["display_0".to_string()]
            }
        );
        assert_eq!(
            calls[2],
            EngineCall::AddTrack {
                track_id: "a0".to_string(),
                stream_ids: vec!["audio".to_string()]
            }
        );

        assert!(h.handler.add_display("display_1", local_video_track("v2")).await);
        assert!(h.handler.remove_display("display_0").await);
        assert!(!h.handler.remove_display("display_9").await);
        assert_eq!(h.engine.count(&EngineCall::RemoveTrack(SenderId(0))), 1);
    }

    #[tokio::test]
    async fn test_camera_track_follows_engine_tracks() {
        let mut h = Harness::new();
        h.connect().await;

        let first: Arc<dyn VideoTrack> = Arc::new(MockVideoTrack::new("cam_0"));
        let second: Arc<dyn VideoTrack> = Arc::new(MockVideoTrack::new("cam_1"));
        h.engine
            .emit(PeerEvent::TrackAdded(RemoteTrack::Video(second.clone())));
        h.engine
            .emit(PeerEvent::TrackRemoved(RemoteTrack::Video(first.clone())));

        let camera = h.handler.camera_stream();
        let c = camera.clone();
        eventually(move || c.has_video_track()).await;
        h.sync().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(camera.has_video_track());

        h.engine
            .emit(PeerEvent::TrackRemoved(RemoteTrack::Video(second.clone())));
        let c = camera.clone();
        eventually(move || !c.has_video_track()).await;
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded_to_client() {
        let mut h = Harness::new();
        h.connect().await;

        h.engine.emit(PeerEvent::IceCandidate(IceCandidate::new(
            "0",
            0,
            "candidate:local",
        )));
        assert_eq!(
            h.next_message().await,
            DeviceMessage::IceCandidate(IceCandidate::new("0", 0, "candidate:local"))
        );
    }
}
