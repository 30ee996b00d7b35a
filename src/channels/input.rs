//! Input channel decoding
//!
//! Text frames carrying one JSON object each:
//!
//! - `{"type": "mouse", "down": 1, "x": 10, "y": 20, "display_label": "display_0"}`
//! - `{"type": "multi-touch", "id": [..], "slot": [..], "x": [..], "y": [..],
//!   "down": 1, "display_label": "display_0"}`
//! - `{"type": "keyboard", "event_type": "keydown", "keycode": "KeyA"}`

use serde_json::Value;

use super::keymap::dom_key_code_to_linux;
use crate::error::{AppError, Result};
use crate::observer::{ConnectionObserver, MultiTouchEvent};
use crate::utils::json::{get_i32, get_i32_array, get_str, parse_json_frame};
use crate::utils::{validate_json_object, JsonType};
use crate::webrtc::engine::DataBuffer;

/// Decoded input channel event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
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
}

impl InputEvent {
    pub fn dispatch(&self, observer: &dyn ConnectionObserver) {
        match self {
            InputEvent::Touch {
                display_label,
                x,
                y,
                down,
            } => observer.on_touch_event(display_label, *x, *y, *down),
            InputEvent::MultiTouch(event) => observer.on_multi_touch_event(event),
            InputEvent::Keyboard { code, down } => observer.on_keyboard_event(*code, *down),
        }
    }
}

/// Decode one input channel frame
pub fn parse_input_event(buffer: &DataBuffer) -> Result<InputEvent> {
    if buffer.binary {
        return Err(AppError::BadRequest(
            "Received binary data over input channel".to_string(),
        ));
    }

    let evt = parse_json_frame(&buffer.data)?;
    validate_json_object(&evt, "", &[("type", JsonType::String)], &[])?;

    match get_str(&evt, "type") {
        "mouse" => parse_mouse(&evt),
        "multi-touch" => parse_multi_touch(&evt),
        "keyboard" => parse_keyboard(&evt),
        other => Err(AppError::BadRequest(format!(
            "Unrecognized event type: {}",
            other
        ))),
    }
}

fn parse_mouse(evt: &Value) -> Result<InputEvent> {
    validate_json_object(
        evt,
        "mouse",
        &[
            ("down", JsonType::Int),
            ("x", JsonType::Int),
            ("y", JsonType::Int),
            ("display_label", JsonType::String),
        ],
        &[],
    )?;

    Ok(InputEvent::Touch {
        display_label: get_str(evt, "display_label").to_string(),
        x: get_i32(evt, "x"),
        y: get_i32(evt, "y"),
        down: get_i32(evt, "down"),
    })
}

fn parse_multi_touch(evt: &Value) -> Result<InputEvent> {
    validate_json_object(
        evt,
        "multi-touch",
        &[
            ("id", JsonType::Array),
            ("down", JsonType::Int),
            ("x", JsonType::Array),
            ("y", JsonType::Array),
            ("slot", JsonType::Array),
            ("display_label", JsonType::String),
        ],
        &[],
    )?;

    let int_array = |name: &str| {
        get_i32_array(evt, name).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Field '{}' of multi-touch message must contain only integers",
                name
            ))
        })
    };
    let ids = int_array("id")?;
    let mut slots = int_array("slot")?;
    let mut xs = int_array("x")?;
    let mut ys = int_array("y")?;

    // The point count comes from `id`; the other arrays must cover it
    let size = ids.len();
    if slots.len() < size || xs.len() < size || ys.len() < size {
        return Err(AppError::BadRequest(format!(
            "Multi-touch arrays shorter than id: id={} slot={} x={} y={}",
            size,
            slots.len(),
            xs.len(),
            ys.len()
        )));
    }
    slots.truncate(size);
    xs.truncate(size);
    ys.truncate(size);

    Ok(InputEvent::MultiTouch(MultiTouchEvent {
        display_label: get_str(evt, "display_label").to_string(),
        ids,
        slots,
        xs,
        ys,
        down: get_i32(evt, "down"),
        size,
    }))
}

fn parse_keyboard(evt: &Value) -> Result<InputEvent> {
    validate_json_object(
        evt,
        "keyboard",
        &[
            ("event_type", JsonType::String),
            ("keycode", JsonType::String),
        ],
        &[],
    )?;

    Ok(InputEvent::Keyboard {
        code: dom_key_code_to_linux(get_str(evt, "keycode")),
        down: get_str(evt, "event_type") == "keydown",
    })
}
