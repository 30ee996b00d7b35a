//! webrtc-rs implementation of the engine traits

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::IceServer;
use super::engine::{
    BitrateSettings, DataBuffer, DataChannel, DataChannelObserver, DataChannelState, LocalTrack,
    PeerConnection, PeerConnectionBuilder, PeerEvent, PeerEventSink, RemoteTrack, SenderId,
    SinkWants, VideoSink, VideoTrack,
};
use super::mdns::{mdns_host_name, mdns_mode};
use super::signaling::{
    ConnectionState, IceCandidate, IceGatheringState, SdpType, SessionDescription,
};
use crate::error::{AppError, Result};

fn rtc_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::WebRtcError(format!("{}: {}", context, e))
}

/// Builds webrtc-rs peer connections with default codecs and interceptors
pub struct RtcPeerConnectionBuilder {
    mdns_mode: MulticastDnsMode,
    next_connection: AtomicU64,
}

impl RtcPeerConnectionBuilder {
    pub fn new() -> Self {
        Self {
            mdns_mode: mdns_mode(),
            next_connection: AtomicU64::new(1),
        }
    }

    fn api(&self, connection: u64) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| rtc_error("Failed to register interceptors", e))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(self.mdns_mode);
        if self.mdns_mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(connection));
        }

        Ok(APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for RtcPeerConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionBuilder for RtcPeerConnectionBuilder {
    async fn build(
        &self,
        events: PeerEventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let api = self.api(connection)?;

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| rtc_error("Failed to create peer connection", e))?;
        let pc = Arc::new(pc);

        install_handlers(&pc, events, connection);
        debug!(
            "Peer connection {} created (mDNS {:?})",
            connection, self.mdns_mode
        );

        Ok(Arc::new(RtcPeerConnection {
            pc,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
        }))
    }
}

/// Route engine callbacks into the session's event queue
fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink, connection: u64) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = match s {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            info!("Peer {} connection state: {}", connection, state);
            sink.emit(PeerEvent::ConnectionStateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
            trace!("Local ICE candidate: {}", init.candidate);
            sink.emit(PeerEvent::IceCandidate(IceCandidate::new(
                init.sdp_mid.unwrap_or_default(),
                init.sdp_mline_index.unwrap_or(0),
                init.candidate,
            )));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let state = match state {
            RTCIceGathererState::New => Some(IceGatheringState::New),
            RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
            RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
            _ => None,
        };
        if let Some(state) = state {
            sink.emit(PeerEvent::IceGatheringChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        sink.emit(PeerEvent::SignalingChanged(state.to_string()));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(PeerEvent::RenegotiationNeeded);
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        debug!("Peer {} remote data channel '{}'", connection, dc.label());
        let channel: Arc<dyn DataChannel> = RtcDataChannel::wrap(dc);
        sink.emit(PeerEvent::DataChannel(channel));
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                spawn_remote_track(track, sink);
            })
        },
    ));
}

/// Announce an inbound track and pump its RTP until it ends
fn spawn_remote_track(track: Arc<TrackRemote>, sink: PeerEventSink) {
    let id = track.id();

    let remote = match track.kind() {
        RTPCodecType::Video => {
            let video = Arc::new(RtcRemoteVideoTrack::new(id.clone()));
            let remote = RemoteTrack::Video(video.clone());
            sink.emit(PeerEvent::TrackAdded(remote.clone()));

            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    video.deliver(&packet);
                }
                debug!("Remote video track {} ended", video.id());
                sink.emit(PeerEvent::TrackRemoved(remote));
            });
            return;
        }
        _ => RemoteTrack::Audio { id },
    };

    sink.emit(PeerEvent::TrackAdded(remote.clone()));
    // Audio from the client is drained but not consumed
    tokio::spawn(async move {
        while track.read_rtp().await.is_ok() {}
        sink.emit(PeerEvent::TrackRemoved(remote));
    });
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| AppError::BadRequest(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_error("Failed to create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_error("Failed to create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| rtc_error("Failed to set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| rtc_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.mid),
            sdp_mline_index: Some(candidate.m_line_index),
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| rtc_error("Failed to add ICE candidate", e))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| rtc_error("Failed to create data channel", e))?;
        info!("Data channel '{}' created", label);
        Ok(RtcDataChannel::wrap(dc))
    }

    async fn add_track(&self, track: LocalTrack, stream_ids: &[String]) -> Result<SenderId> {
        // webrtc-rs takes the stream id from the track itself
        if !stream_ids.iter().any(|id| id == track.stream_id()) {
            warn!(
                "Track {} carries stream id {}, expected one of {:?}",
                track.id(),
                track.stream_id(),
                stream_ids
            );
        }

        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|e| rtc_error("Failed to add track", e))?;

        // RTCP must be read for interceptors such as NACK to work
        let rtcp_sender = sender.clone();
        tokio::spawn(async move { while rtcp_sender.read_rtcp().await.is_ok() {} });

        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        Ok(SenderId(id))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let rtp_sender = self
            .senders
            .lock()
            .remove(&sender.0)
            .ok_or_else(|| AppError::NotFound(format!("Unknown sender {}", sender.0)))?;

        self.pc
            .remove_track(&rtp_sender)
            .await
            .map_err(|e| rtc_error("Failed to remove track", e))
    }

    fn set_bitrate(&self, settings: BitrateSettings) -> Result<()> {
        // webrtc-rs has no congestion controller to seed; encoders read the
        // start bitrate from the device configuration
        debug!("Bitrate hint: {:?}", settings);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| rtc_error("Failed to close peer connection", e))
    }
}

/// Frames kept for a channel nobody has registered on yet
const MAX_BACKLOG_FRAMES: usize = 256;

#[derive(Default)]
struct ObserverSlot {
    observer: Option<Arc<dyn DataChannelObserver>>,
    /// Frames that arrived before an observer was registered
    backlog: Vec<DataBuffer>,
    open_reported: bool,
    /// Set once the observer unregisters; later frames are dropped
    detached: bool,
}

impl ObserverSlot {
    /// Observer to notify of the open transition, at most once
    fn open_target(&mut self) -> Option<Arc<dyn DataChannelObserver>> {
        let observer = self.observer.clone()?;
        if self.open_reported {
            return None;
        }
        self.open_reported = true;
        Some(observer)
    }

    /// Observer to hand `buffer` to, or `None` when it was kept or dropped
    fn message_target(&mut self, buffer: &DataBuffer) -> Option<Arc<dyn DataChannelObserver>> {
        if let Some(observer) = &self.observer {
            return Some(observer.clone());
        }
        if self.detached {
            trace!("Dropping {} byte frame on detached channel", buffer.data.len());
        } else if self.backlog.len() >= MAX_BACKLOG_FRAMES {
            warn!("Data channel backlog full, dropping {} byte frame", buffer.data.len());
        } else {
            self.backlog.push(buffer.clone());
        }
        None
    }

    /// Install `observer` and replay what it missed. Runs under the slot lock
    /// so live frames can't overtake the backlog.
    fn attach(&mut self, observer: Arc<dyn DataChannelObserver>, is_open: bool) {
        self.observer = Some(observer.clone());
        self.detached = false;
        if is_open && !self.open_reported {
            self.open_reported = true;
            observer.on_state_change(DataChannelState::Open);
        }
        for buffer in std::mem::take(&mut self.backlog) {
            observer.on_message(&buffer);
        }
    }

    fn detach(&mut self) {
        self.observer = None;
        self.detached = true;
        self.backlog.clear();
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    slot: Arc<Mutex<ObserverSlot>>,
}

impl RtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let slot = Arc::new(Mutex::new(ObserverSlot::default()));

        let open_slot = slot.clone();
        dc.on_open(Box::new(move || {
            let observer = open_slot.lock().open_target();
            if let Some(observer) = observer {
                observer.on_state_change(DataChannelState::Open);
            }
            Box::pin(async {})
        }));

        let close_slot = slot.clone();
        dc.on_close(Box::new(move || {
            let observer = close_slot.lock().observer.clone();
            if let Some(observer) = observer {
                observer.on_state_change(DataChannelState::Closed);
            }
            Box::pin(async {})
        }));

        let message_slot = slot.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let buffer = DataBuffer {
                data: msg.data,
                binary: !msg.is_string,
            };
            let observer = message_slot.lock().message_target(&buffer);
            if let Some(observer) = observer {
                observer.on_message(&buffer);
            }
            Box::pin(async {})
        }));

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            slot,
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        let mut slot = self.slot.lock();
        // The ready state flips before on_open runs, so reading it under the
        // lock means either this replay or on_open reports the transition
        let is_open = self.state() == DataChannelState::Open;
        slot.attach(observer, is_open);
    }

    fn unregister_observer(&self) {
        self.slot.lock().detach();
    }

    async fn send(&self, buffer: DataBuffer) -> Result<()> {
        let result = if buffer.binary {
            self.dc.send(&buffer.data).await
        } else {
            let text = String::from_utf8(buffer.data.to_vec()).map_err(|e| {
                AppError::ChannelError(format!(
                    "Text frame on '{}' is not valid UTF-8: {}",
                    self.label, e
                ))
            })?;
            self.dc.send_text(text).await
        };
        result
            .map(|_| ())
            .map_err(|e| AppError::ChannelError(format!("Send on '{}' failed: {}", self.label, e)))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }
}

struct RtcRemoteVideoTrack {
    id: String,
    sink: Mutex<Option<(Arc<dyn VideoSink>, SinkWants)>>,
}

impl RtcRemoteVideoTrack {
    fn new(id: String) -> Self {
        Self {
            id,
            sink: Mutex::new(None),
        }
    }

    fn deliver(&self, packet: &webrtc::rtp::packet::Packet) {
        let sink = self.sink.lock().as_ref().map(|(sink, _)| sink.clone());
        if let Some(sink) = sink {
            sink.on_rtp_packet(packet);
        }
    }
}

impl VideoTrack for RtcRemoteVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_or_update_sink(&self, sink: Arc<dyn VideoSink>, wants: SinkWants) {
        debug!("Camera track {} sink wants {:?}", self.id, wants);
        *self.sink.lock() = Some((sink, wants));
    }
}
