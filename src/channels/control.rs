//! Device control channel
//!
//! The device creates this channel itself when building the connection, so
//! it is usable before the client sends anything. Inbound frames are JSON
//! commands; outbound frames are whatever the device side writes through a
//! [`ControlSender`].

use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::observer::{Button, ConnectionObserver};
use crate::utils::json::{get_str, parse_json_frame};
use crate::utils::{validate_json_object, JsonType};
use crate::webrtc::engine::{DataBuffer, DataChannel};

const DEVICE_STATE_COMMAND: &str = "device_state";
const CAMERA_COMMAND_PREFIX: &str = "camera_";

/// Decoded control command
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Fields are forwarded individually, each only if present
    DeviceState {
        lid_switch_open: Option<bool>,
        hinge_angle_value: Option<i32>,
    },
    /// Whole message, forwarded opaquely
    Camera(Value),
    Button {
        button: Button,
        down: bool,
    },
    CustomAction {
        command: String,
        button_state: String,
    },
}

impl ControlCommand {
    pub fn dispatch(&self, observer: &dyn ConnectionObserver) {
        match self {
            ControlCommand::DeviceState {
                lid_switch_open,
                hinge_angle_value,
            } => {
                if let Some(open) = lid_switch_open {
                    observer.on_lid_state_change(*open);
                }
                if let Some(angle) = hinge_angle_value {
                    observer.on_hinge_angle_change(*angle);
                }
            }
            ControlCommand::Camera(msg) => observer.on_camera_control_msg(msg),
            ControlCommand::Button { button, down } => observer.on_button(*button, *down),
            ControlCommand::CustomAction {
                command,
                button_state,
            } => observer.on_custom_action_button(command, button_state),
        }
    }
}

/// Decode one control channel frame
pub fn parse_control_message(data: &[u8]) -> Result<ControlCommand> {
    let evt = parse_json_frame(data)?;
    validate_json_object(
        &evt,
        "command",
        &[("command", JsonType::String)],
        &[
            ("button_state", JsonType::String),
            ("lid_switch_open", JsonType::Bool),
            ("hinge_angle_value", JsonType::Int),
        ],
    )?;

    let command = get_str(&evt, "command");

    if command == DEVICE_STATE_COMMAND {
        return Ok(ControlCommand::DeviceState {
            lid_switch_open: evt.get("lid_switch_open").and_then(Value::as_bool),
            hinge_angle_value: evt
                .get("hinge_angle_value")
                .and_then(Value::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
        });
    }

    if command.starts_with(CAMERA_COMMAND_PREFIX) {
        return Ok(ControlCommand::Camera(evt));
    }

    let button_state = get_str(&evt, "button_state");
    Ok(match Button::from_command(command) {
        Some(button) => ControlCommand::Button {
            button,
            down: button_state == "down",
        },
        None => ControlCommand::CustomAction {
            command: command.to_string(),
            button_state: button_state.to_string(),
        },
    })
}

/// Device side writer for the control channel
///
/// Holds the channel weakly; sends fail once the session is gone.
#[derive(Clone)]
pub struct ControlSender {
    channel: Weak<dyn DataChannel>,
}

impl ControlSender {
    pub fn new(channel: &Arc<dyn DataChannel>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
        }
    }

    /// Send `msg` as compact JSON in a text frame
    pub async fn send_json(&self, msg: &Value) -> Result<()> {
        let text = serde_json::to_vec(msg)?;
        self.send_raw(text, false).await
    }

    /// Send a pre-serialized payload
    pub async fn send_raw(&self, data: impl Into<Bytes>, binary: bool) -> Result<()> {
        let channel = self
            .channel
            .upgrade()
            .ok_or_else(|| AppError::ChannelError("Control channel is closed".to_string()))?;
        channel
            .send(DataBuffer {
                data: data.into(),
                binary,
            })
            .await
    }
}

impl std::fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSender")
            .field("alive", &(self.channel.strong_count() > 0))
            .finish()
    }
}
