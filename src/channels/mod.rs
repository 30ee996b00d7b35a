//! Data channel protocol handlers
//!
//! Every data channel of a session is bound to one [`ChannelHandler`], whose
//! protocol is picked once from the channel label. The handler decodes
//! inbound frames and forwards typed events to the session's
//! [`ConnectionObserver`]. Protocol violations are logged (rate limited) and
//! the frame is dropped; nothing is reported back to the client.
//!
//! A handler stays subscribed to its channel exactly as long as the
//! [`ChannelRegistration`] returned by [`ChannelHandler::attach`] lives.

pub mod camera;
pub mod control;
pub mod input;
pub mod keymap;
pub mod passthrough;

pub use camera::{CameraReceiver, CAMERA_DATA_EOF};
pub use control::{parse_control_message, ControlCommand, ControlSender};
pub use input::{parse_input_event, InputEvent};
pub use passthrough::{ChannelSender, PassthroughReceiver};

use std::sync::{Arc, Weak};

use tracing::{debug, info, trace};

use crate::error_throttled;
use crate::observer::{ConnectionObserver, PassthroughKind};
use crate::utils::LogThrottler;
use crate::webrtc::config::WebRtcConfig;
use crate::webrtc::engine::{DataBuffer, DataChannel, DataChannelObserver, DataChannelState};

pub const INPUT_CHANNEL_LABEL: &str = "input-channel";
pub const ADB_CHANNEL_LABEL: &str = "adb-channel";
pub const BLUETOOTH_CHANNEL_LABEL: &str = "bluetooth-channel";
pub const CAMERA_DATA_CHANNEL_LABEL: &str = "camera-data-channel";
pub const LOCATION_CHANNEL_LABEL: &str = "location-channel";
pub const KML_LOCATIONS_CHANNEL_LABEL: &str = "kml-locations-channel";
pub const GPX_LOCATIONS_CHANNEL_LABEL: &str = "gpx-locations-channel";
/// Created by the device, never expected from the client
pub const DEVICE_CONTROL_LABEL: &str = "device-control";

/// Protocol spoken on a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Input,
    Control,
    Camera,
    Passthrough(PassthroughKind),
    /// Unknown label, kept open without decoding
    Generic,
}

/// Labels of the channels the client may open
static CHANNEL_LABELS: &[(&str, ChannelKind)] = &[
    (INPUT_CHANNEL_LABEL, ChannelKind::Input),
    (ADB_CHANNEL_LABEL, ChannelKind::Passthrough(PassthroughKind::Adb)),
    (
        BLUETOOTH_CHANNEL_LABEL,
        ChannelKind::Passthrough(PassthroughKind::Bluetooth),
    ),
    (CAMERA_DATA_CHANNEL_LABEL, ChannelKind::Camera),
    (
        LOCATION_CHANNEL_LABEL,
        ChannelKind::Passthrough(PassthroughKind::Location),
    ),
    (
        KML_LOCATIONS_CHANNEL_LABEL,
        ChannelKind::Passthrough(PassthroughKind::KmlLocations),
    ),
    (
        GPX_LOCATIONS_CHANNEL_LABEL,
        ChannelKind::Passthrough(PassthroughKind::GpxLocations),
    ),
];

impl ChannelKind {
    pub fn from_label(label: &str) -> Self {
        CHANNEL_LABELS
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, kind)| *kind)
            .unwrap_or(ChannelKind::Generic)
    }
}

/// Per-channel resource limits
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    /// Outbound buffer cap for passthrough sends
    pub max_buffered_amount: usize,
    pub max_camera_capture_bytes: usize,
}

impl From<&WebRtcConfig> for ChannelLimits {
    fn from(config: &WebRtcConfig) -> Self {
        Self {
            max_buffered_amount: config.max_buffered_amount,
            max_camera_capture_bytes: config.max_camera_capture_bytes,
        }
    }
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self::from(&WebRtcConfig::default())
    }
}

/// Decode state for one channel
enum ChannelProtocol {
    Input,
    Control,
    Camera(CameraReceiver),
    Passthrough(PassthroughReceiver),
    Generic,
}

impl ChannelProtocol {
    fn new(kind: ChannelKind, limits: &ChannelLimits) -> Self {
        match kind {
            ChannelKind::Input => ChannelProtocol::Input,
            ChannelKind::Control => ChannelProtocol::Control,
            ChannelKind::Camera => {
                ChannelProtocol::Camera(CameraReceiver::new(limits.max_camera_capture_bytes))
            }
            ChannelKind::Passthrough(kind) => {
                ChannelProtocol::Passthrough(PassthroughReceiver::new(kind))
            }
            ChannelKind::Generic => ChannelProtocol::Generic,
        }
    }
}

pub struct ChannelHandler {
    client_id: u64,
    label: String,
    channel: Weak<dyn DataChannel>,
    observer: Arc<dyn ConnectionObserver>,
    protocol: ChannelProtocol,
    limits: ChannelLimits,
    throttler: LogThrottler,
}

impl ChannelHandler {
    /// Bind `channel` to a handler of `kind` and subscribe it
    pub fn attach(
        kind: ChannelKind,
        channel: Arc<dyn DataChannel>,
        observer: Arc<dyn ConnectionObserver>,
        limits: ChannelLimits,
        client_id: u64,
    ) -> ChannelRegistration {
        let handler = Arc::new(Self {
            client_id,
            label: channel.label().to_string(),
            channel: Arc::downgrade(&channel),
            observer,
            protocol: ChannelProtocol::new(kind, &limits),
            limits,
            throttler: LogThrottler::default(),
        });

        channel.register_observer(handler);
        debug!(
            "Client {} attached {:?} handler to '{}'",
            client_id,
            kind,
            channel.label()
        );

        ChannelRegistration { channel }
    }

    fn handle_message(&self, buffer: &DataBuffer) {
        match &self.protocol {
            ChannelProtocol::Input => match parse_input_event(buffer) {
                Ok(event) => event.dispatch(self.observer.as_ref()),
                Err(e) => error_throttled!(
                    self.throttler,
                    &self.label,
                    "Client {} dropped input frame: {}",
                    self.client_id,
                    e
                ),
            },
            ChannelProtocol::Control => match parse_control_message(&buffer.data) {
                Ok(command) => command.dispatch(self.observer.as_ref()),
                Err(e) => error_throttled!(
                    self.throttler,
                    &self.label,
                    "Client {} dropped control frame: {}",
                    self.client_id,
                    e
                ),
            },
            ChannelProtocol::Camera(receiver) => {
                if let Some(capture) = receiver.push(&buffer.data) {
                    self.observer.on_camera_data(capture);
                }
            }
            ChannelProtocol::Passthrough(receiver) => {
                if receiver.take_first_message() {
                    if let Some(channel) = self.channel.upgrade() {
                        info!(
                            "Client {} started using {} channel",
                            self.client_id,
                            receiver.kind()
                        );
                        self.observer.on_channel_open(
                            receiver.kind(),
                            ChannelSender::new(&channel, self.limits.max_buffered_amount),
                        );
                    }
                }
                self.observer.on_channel_message(receiver.kind(), &buffer.data);
            }
            ChannelProtocol::Generic => {
                trace!(
                    "Client {} ignoring {} bytes on '{}'",
                    self.client_id,
                    buffer.data.len(),
                    self.label
                );
            }
        }
    }
}

impl DataChannelObserver for ChannelHandler {
    fn on_state_change(&self, state: DataChannelState) {
        debug!(
            "Client {} channel '{}' is {}",
            self.client_id, self.label, state
        );

        if matches!(self.protocol, ChannelProtocol::Control) && state == DataChannelState::Open {
            if let Some(channel) = self.channel.upgrade() {
                self.observer
                    .on_control_channel_open(ControlSender::new(&channel));
            }
        }
    }

    fn on_message(&self, buffer: &DataBuffer) {
        self.handle_message(buffer);
    }
}

/// Subscription of a handler to its channel; dropping it unsubscribes
pub struct ChannelRegistration {
    channel: Arc<dyn DataChannel>,
}

impl Drop for ChannelRegistration {
    fn drop(&mut self) {
        self.channel.unregister_observer();
    }
}
