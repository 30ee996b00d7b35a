//! In-memory engine and observer doubles for unit tests

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::IceServer;
use super::engine::{
    BitrateSettings, DataBuffer, DataChannel, DataChannelObserver, DataChannelState, LocalTrack,
    PeerConnection, PeerConnectionBuilder, PeerEvent, PeerEventSink, SenderId, SinkWants,
    VideoSink, VideoTrack,
};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::channels::{ChannelSender, ControlSender};
use crate::error::{AppError, Result};
use crate::observer::{
    Button, ConnectionObserver, ConnectionObserverFactory, MultiTouchEvent, PassthroughKind,
};

/// Poll `cond` until it holds, failing the test after two seconds
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn local_video_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        id.to_owned(),
    ))
}

// ---------------------------------------------------------------------------
// Data channel

pub struct MockDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    observer: Mutex<Option<Arc<dyn DataChannelObserver>>>,
    sent: Mutex<Vec<DataBuffer>>,
    buffered: AtomicUsize,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            observer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
        }
    }

    /// Simulate an inbound frame
    pub fn deliver(&self, buffer: DataBuffer) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_message(&buffer);
        }
    }

    pub fn set_state(&self, state: DataChannelState) {
        *self.state.lock() = state;
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_state_change(state);
        }
    }

    pub fn sent(&self) -> Vec<DataBuffer> {
        self.sent.lock().clone()
    }

    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn unregister_observer(&self) {
        self.observer.lock().take();
    }

    async fn send(&self, buffer: DataBuffer) -> Result<()> {
        self.sent.lock().push(buffer);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Video

#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<u16>>,
}

impl RecordingSink {
    pub fn sequence_numbers(&self) -> Vec<u16> {
        self.packets.lock().clone()
    }
}

impl VideoSink for RecordingSink {
    fn on_rtp_packet(&self, packet: &webrtc::rtp::packet::Packet) {
        self.packets.lock().push(packet.header.sequence_number);
    }
}

pub struct MockVideoTrack {
    id: String,
    sink: Mutex<Option<Arc<dyn VideoSink>>>,
    wants: Mutex<Option<SinkWants>>,
    updates: AtomicUsize,
}

impl MockVideoTrack {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sink: Mutex::new(None),
            wants: Mutex::new(None),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn sink_updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn last_wants(&self) -> Option<SinkWants> {
        *self.wants.lock()
    }

    pub fn push_packet(&self, sequence_number: u16) {
        let mut packet = webrtc::rtp::packet::Packet::default();
        packet.header.sequence_number = sequence_number;
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.on_rtp_packet(&packet);
        }
    }
}

impl VideoTrack for MockVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn add_or_update_sink(&self, sink: Arc<dyn VideoSink>, wants: SinkWants) {
        *self.sink.lock() = Some(sink);
        *self.wants.lock() = Some(wants);
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine

/// Engine call, in the order the engine saw it
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Build(Vec<IceServer>),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddIceCandidate(String),
    CreateDataChannel(String),
    AddTrack { track_id: String, stream_ids: Vec<String> },
    RemoveTrack(SenderId),
    SetBitrate(BitrateSettings),
    Close,
}

/// Failure switches; may be flipped while a session runs
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub fail_build: bool,
    pub fail_data_channel: bool,
    pub fail_create_offer: bool,
    pub fail_set_local: bool,
    pub fail_set_remote: bool,
    pub fail_add_candidate: bool,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<EngineCall>>,
    behavior: Mutex<MockBehavior>,
    events: Mutex<Option<PeerEventSink>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    next_sender: AtomicU64,
}

impl MockState {
    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    fn fail_if(&self, flag: impl Fn(&MockBehavior) -> bool, what: &str) -> Result<()> {
        let behavior = self.behavior.lock();
        if flag(&*behavior) {
            Err(AppError::WebRtcError(format!("mock {} failure", what)))
        } else {
            Ok(())
        }
    }
}

/// Recording engine; one instance may build several connections
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.calls.lock().clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.state.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn behavior(&self, update: impl FnOnce(&mut MockBehavior)) {
        let mut behavior = self.state.behavior.lock();
        update(&mut *behavior);
    }

    /// Inject an engine notification into the most recently built connection
    pub fn emit(&self, event: PeerEvent) {
        let sink = self.state.events.lock().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    pub fn created_channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.state
            .channels
            .lock()
            .iter()
            .find(|c| c.label() == label)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionBuilder for MockEngine {
    async fn build(
        &self,
        events: PeerEventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>> {
        self.state.record(EngineCall::Build(ice_servers.to_vec()));
        self.state.fail_if(|b| b.fail_build, "build")?;
        *self.state.events.lock() = Some(events);
        Ok(Arc::new(MockPeer {
            state: self.state.clone(),
        }))
    }
}

struct MockPeer {
    state: Arc<MockState>,
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.state.record(EngineCall::CreateOffer);
        self.state.fail_if(|b| b.fail_create_offer, "create offer")?;
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.state.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.record(EngineCall::SetLocal(desc.sdp_type));
        self.state.fail_if(|b| b.fail_set_local, "set local")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.record(EngineCall::SetRemote(desc.sdp_type));
        self.state.fail_if(|b| b.fail_set_remote, "set remote")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state
            .record(EngineCall::AddIceCandidate(candidate.candidate));
        self.state.fail_if(|b| b.fail_add_candidate, "add candidate")
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.state
            .record(EngineCall::CreateDataChannel(label.to_string()));
        self.state.fail_if(|b| b.fail_data_channel, "data channel")?;
        let channel = Arc::new(MockDataChannel::new(label));
        self.state.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, track: LocalTrack, stream_ids: &[String]) -> Result<SenderId> {
        self.state.record(EngineCall::AddTrack {
            track_id: track.id().to_string(),
            stream_ids: stream_ids.to_vec(),
        });
        Ok(SenderId(
            self.state.next_sender.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        self.state.record(EngineCall::RemoveTrack(sender));
        Ok(())
    }

    fn set_bitrate(&self, settings: BitrateSettings) -> Result<()> {
        self.state.record(EngineCall::SetBitrate(settings));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.record(EngineCall::Close);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observer

#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Connected,
    Touch {
        display_label: String,
        x: i32,
        y: i32,
        down: i32,
    },
    MultiTouch(MultiTouchEvent),
    Keyboard {
        code: u16,
        down: bool,
    },
    Button(Button, bool),
    CustomAction(String, String),
    Lid(bool),
    Hinge(i32),
    CameraControl(Value),
    CameraData(Vec<u8>),
    ControlOpen,
    ChannelOpen(PassthroughKind),
    ChannelMessage(PassthroughKind, Vec<u8>),
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
    control: Mutex<Option<ControlSender>>,
    senders: Mutex<Vec<ChannelSender>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn control_sender(&self) -> Option<ControlSender> {
        self.control.lock().clone()
    }

    pub fn channel_senders(&self) -> Vec<ChannelSender> {
        self.senders.lock().clone()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_connected(&self) {
        self.push(ObservedEvent::Connected);
    }

    fn on_touch_event(&self, display_label: &str, x: i32, y: i32, down: i32) {
        self.push(ObservedEvent::Touch {
            display_label: display_label.to_string(),
            x,
            y,
            down,
        });
    }

    fn on_multi_touch_event(&self, event: &MultiTouchEvent) {
        self.push(ObservedEvent::MultiTouch(event.clone()));
    }

    fn on_keyboard_event(&self, code: u16, down: bool) {
        self.push(ObservedEvent::Keyboard { code, down });
    }

    fn on_button(&self, button: Button, down: bool) {
        self.push(ObservedEvent::Button(button, down));
    }

    fn on_custom_action_button(&self, command: &str, button_state: &str) {
        self.push(ObservedEvent::CustomAction(
            command.to_string(),
            button_state.to_string(),
        ));
    }

    fn on_lid_state_change(&self, lid_open: bool) {
        self.push(ObservedEvent::Lid(lid_open));
    }

    fn on_hinge_angle_change(&self, hinge_angle: i32) {
        self.push(ObservedEvent::Hinge(hinge_angle));
    }

    fn on_camera_control_msg(&self, msg: &Value) {
        self.push(ObservedEvent::CameraControl(msg.clone()));
    }

    fn on_camera_data(&self, data: Vec<u8>) {
        self.push(ObservedEvent::CameraData(data));
    }

    fn on_control_channel_open(&self, sender: ControlSender) {
        *self.control.lock() = Some(sender);
        self.push(ObservedEvent::ControlOpen);
    }

    fn on_channel_open(&self, kind: PassthroughKind, sender: ChannelSender) {
        self.senders.lock().push(sender);
        self.push(ObservedEvent::ChannelOpen(kind));
    }

    fn on_channel_message(&self, kind: PassthroughKind, data: &[u8]) {
        self.push(ObservedEvent::ChannelMessage(kind, data.to_vec()));
    }
}

/// Hands out one shared [`RecordingObserver`] to every client
#[derive(Default, Clone)]
pub struct RecordingObserverFactory {
    pub observer: Arc<RecordingObserver>,
}

impl ConnectionObserverFactory for RecordingObserverFactory {
    fn create(&self, _client_id: u64) -> Arc<dyn ConnectionObserver> {
        self.observer.clone()
    }
}
