//! Peer connection engine abstraction
//!
//! The session layer never talks to a WebRTC stack directly. It drives a
//! [`PeerConnection`] built by a [`PeerConnectionBuilder`], and receives the
//! engine's notifications as [`PeerEvent`] messages. Engine callbacks only
//! ever post into the event queue, so no engine thread can re-enter session
//! state or the engine's own teardown.
//!
//! The production implementation lives in [`super::peer`]; tests use the
//! recording engine in `super::testing`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

use super::config::IceServer;
use super::signaling::{ConnectionState, IceCandidate, IceGatheringState, SessionDescription};
use crate::error::Result;

/// Outbound media track handed to the engine
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Engine handle for an outbound sender, returned by `add_track`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Bitrate hints applied to the whole connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitrateSettings {
    pub start_bitrate_bps: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataChannelState::Connecting => write!(f, "connecting"),
            DataChannelState::Open => write!(f, "open"),
            DataChannelState::Closing => write!(f, "closing"),
            DataChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// One data channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub data: Bytes,
    /// `false` for text frames
    pub binary: bool,
}

impl DataBuffer {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }

    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: false,
        }
    }
}

/// Receiver of a data channel's state changes and frames
pub trait DataChannelObserver: Send + Sync {
    fn on_state_change(&self, state: DataChannelState);
    fn on_message(&self, buffer: &DataBuffer);
}

/// Engine data channel
///
/// At most one observer is registered at a time. Registering replaces the
/// previous observer; unregistering guarantees no further callbacks.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn state(&self) -> DataChannelState;
    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>);
    fn unregister_observer(&self);
    async fn send(&self, buffer: DataBuffer) -> Result<()>;
    /// Bytes queued for sending but not yet handed to the transport
    async fn buffered_amount(&self) -> usize;
}

/// Delivery preferences of a video sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkWants {
    pub max_pixel_count: Option<u32>,
    pub max_framerate: Option<u32>,
}

/// Consumer of an inbound video track
pub trait VideoSink: Send + Sync {
    fn on_rtp_packet(&self, packet: &webrtc::rtp::packet::Packet);
}

/// Inbound video track owned by the engine
pub trait VideoTrack: Send + Sync {
    fn id(&self) -> &str;
    fn add_or_update_sink(&self, sink: Arc<dyn VideoSink>, wants: SinkWants);
}

/// Inbound media track announced by the engine
#[derive(Clone)]
pub enum RemoteTrack {
    Video(Arc<dyn VideoTrack>),
    Audio { id: String },
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteTrack::Video(track) => write!(f, "Video({})", track.id()),
            RemoteTrack::Audio { id } => write!(f, "Audio({})", id),
        }
    }
}

/// Engine notification
pub enum PeerEvent {
    ConnectionStateChanged(ConnectionState),
    /// Locally gathered candidate, to be forwarded to the client
    IceCandidate(IceCandidate),
    IceGatheringChanged(IceGatheringState),
    SignalingChanged(String),
    /// Data channel opened by the client
    DataChannel(Arc<dyn DataChannel>),
    TrackAdded(RemoteTrack),
    TrackRemoved(RemoteTrack),
    RenegotiationNeeded,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::ConnectionStateChanged(s) => write!(f, "ConnectionStateChanged({})", s),
            PeerEvent::IceCandidate(c) => write!(f, "IceCandidate({:?})", c),
            PeerEvent::IceGatheringChanged(s) => write!(f, "IceGatheringChanged({})", s),
            PeerEvent::SignalingChanged(s) => write!(f, "SignalingChanged({})", s),
            PeerEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            PeerEvent::TrackAdded(t) => write!(f, "TrackAdded({:?})", t),
            PeerEvent::TrackRemoved(t) => write!(f, "TrackRemoved({:?})", t),
            PeerEvent::RenegotiationNeeded => write!(f, "RenegotiationNeeded"),
        }
    }
}

/// Non-blocking handle engines use to post notifications
#[derive(Clone)]
pub struct PeerEventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event; returns `false` once the session is gone
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A single engine peer connection
///
/// Every method may suspend; callers that must not wait run them on an
/// [`super::operations::OperationsChain`] and receive the result as a
/// completion.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn add_track(&self, track: LocalTrack, stream_ids: &[String]) -> Result<SenderId>;
    async fn remove_track(&self, sender: SenderId) -> Result<()>;
    fn set_bitrate(&self, settings: BitrateSettings) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Factory for engine connections
#[async_trait]
pub trait PeerConnectionBuilder: Send + Sync {
    async fn build(
        &self,
        events: PeerEventSink,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>>;
}
