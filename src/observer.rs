//! Device-side consumer of decoded client events
//!
//! A [`ConnectionObserver`] is created per client by a
//! [`ConnectionObserverFactory`]. Channel handlers call it with validated,
//! typed events; it never sees raw JSON except for camera control messages,
//! which are forwarded opaquely.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::channels::{ChannelSender, ControlSender};

/// Hardware buttons reachable from the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Power,
    Back,
    Home,
    Menu,
    VolumeDown,
    VolumeUp,
}

/// Control channel command names with a dedicated button
static BUTTON_COMMANDS: &[(&str, Button)] = &[
    ("power", Button::Power),
    ("back", Button::Back),
    ("home", Button::Home),
    ("menu", Button::Menu),
    ("volumedown", Button::VolumeDown),
    ("volumeup", Button::VolumeUp),
];

impl Button {
    pub fn from_command(command: &str) -> Option<Self> {
        BUTTON_COMMANDS
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, button)| *button)
    }

    pub fn command(self) -> &'static str {
        BUTTON_COMMANDS
            .iter()
            .find(|(_, button)| *button == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }
}

/// Byte passthrough channels, opened lazily on first traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassthroughKind {
    Adb,
    Bluetooth,
    Location,
    KmlLocations,
    GpxLocations,
}

impl std::fmt::Display for PassthroughKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassthroughKind::Adb => write!(f, "adb"),
            PassthroughKind::Bluetooth => write!(f, "bluetooth"),
            PassthroughKind::Location => write!(f, "location"),
            PassthroughKind::KmlLocations => write!(f, "kml-locations"),
            PassthroughKind::GpxLocations => write!(f, "gpx-locations"),
        }
    }
}

/// Multi-touch report; all arrays have `size` elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiTouchEvent {
    pub display_label: String,
    pub ids: Vec<i32>,
    pub slots: Vec<i32>,
    pub xs: Vec<i32>,
    pub ys: Vec<i32>,
    pub down: i32,
    pub size: usize,
}

/// Device-side policy for one client connection
///
/// Callbacks are invoked from the engine's data channel tasks and from the
/// session task; implementations must not block.
pub trait ConnectionObserver: Send + Sync {
    /// The peer connection reached the connected state
    fn on_connected(&self);

    fn on_touch_event(&self, display_label: &str, x: i32, y: i32, down: i32);
    fn on_multi_touch_event(&self, event: &MultiTouchEvent);
    /// `code` is a Linux input event code
    fn on_keyboard_event(&self, code: u16, down: bool);

    fn on_button(&self, button: Button, down: bool);
    fn on_custom_action_button(&self, command: &str, button_state: &str);
    fn on_lid_state_change(&self, lid_open: bool);
    fn on_hinge_angle_change(&self, hinge_angle: i32);
    fn on_camera_control_msg(&self, msg: &Value);
    /// One complete capture received on the camera data channel
    fn on_camera_data(&self, data: Vec<u8>);

    /// The device control channel is open and can be written to
    fn on_control_channel_open(&self, sender: ControlSender);
    /// First message arrived on a passthrough channel
    fn on_channel_open(&self, kind: PassthroughKind, sender: ChannelSender);
    fn on_channel_message(&self, kind: PassthroughKind, data: &[u8]);
}

pub trait ConnectionObserverFactory: Send + Sync {
    fn create(&self, client_id: u64) -> Arc<dyn ConnectionObserver>;
}

/// Observer that only logs, used by the standalone server
pub struct LoggingObserver {
    client_id: u64,
}

impl LoggingObserver {
    pub fn new(client_id: u64) -> Self {
        Self { client_id }
    }
}

impl ConnectionObserver for LoggingObserver {
    fn on_connected(&self) {
        info!("Client {} connected", self.client_id);
    }

    fn on_touch_event(&self, display_label: &str, x: i32, y: i32, down: i32) {
        debug!(
            "Client {} touch on {}: ({}, {}) down={}",
            self.client_id, display_label, x, y, down
        );
    }

    fn on_multi_touch_event(&self, event: &MultiTouchEvent) {
        debug!(
            "Client {} multi-touch on {}: {} points down={}",
            self.client_id, event.display_label, event.size, event.down
        );
    }

    fn on_keyboard_event(&self, code: u16, down: bool) {
        debug!("Client {} key {} down={}", self.client_id, code, down);
    }

    fn on_button(&self, button: Button, down: bool) {
        info!(
            "Client {} button {} down={}",
            self.client_id,
            button.command(),
            down
        );
    }

    fn on_custom_action_button(&self, command: &str, button_state: &str) {
        info!(
            "Client {} custom action {} state={}",
            self.client_id, command, button_state
        );
    }

    fn on_lid_state_change(&self, lid_open: bool) {
        info!("Client {} lid open={}", self.client_id, lid_open);
    }

    fn on_hinge_angle_change(&self, hinge_angle: i32) {
        info!("Client {} hinge angle {}", self.client_id, hinge_angle);
    }

    fn on_camera_control_msg(&self, msg: &Value) {
        debug!("Client {} camera control: {}", self.client_id, msg);
    }

    fn on_camera_data(&self, data: Vec<u8>) {
        debug!("Client {} camera capture: {} bytes", self.client_id, data.len());
    }

    fn on_control_channel_open(&self, _sender: ControlSender) {
        info!("Client {} control channel open", self.client_id);
    }

    fn on_channel_open(&self, kind: PassthroughKind, sender: ChannelSender) {
        info!(
            "Client {} opened {} channel '{}'",
            self.client_id,
            kind,
            sender.label()
        );
    }

    fn on_channel_message(&self, kind: PassthroughKind, data: &[u8]) {
        debug!(
            "Client {} {} message: {} bytes",
            self.client_id,
            kind,
            data.len()
        );
    }
}

/// Factory for [`LoggingObserver`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserverFactory;

impl ConnectionObserverFactory for LoggingObserverFactory {
    fn create(&self, client_id: u64) -> Arc<dyn ConnectionObserver> {
        Arc::new(LoggingObserver::new(client_id))
    }
}
