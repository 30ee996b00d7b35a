//! Browser key code mapping
//!
//! Maps DOM `KeyboardEvent.code` strings to Linux input event codes.
//! Reference: linux/input-event-codes.h

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Linux input event key codes
pub mod linux {
    pub const KEY_RESERVED: u16 = 0;
    pub const KEY_ESC: u16 = 1;
    pub const KEY_1: u16 = 2;
    pub const KEY_2: u16 = 3;
    pub const KEY_3: u16 = 4;
    pub const KEY_4: u16 = 5;
    pub const KEY_5: u16 = 6;
    pub const KEY_6: u16 = 7;
    pub const KEY_7: u16 = 8;
    pub const KEY_8: u16 = 9;
    pub const KEY_9: u16 = 10;
    pub const KEY_0: u16 = 11;
    pub const KEY_MINUS: u16 = 12;
    pub const KEY_EQUAL: u16 = 13;
    pub const KEY_BACKSPACE: u16 = 14;
    pub const KEY_TAB: u16 = 15;
    pub const KEY_Q: u16 = 16;
    pub const KEY_W: u16 = 17;
    pub const KEY_E: u16 = 18;
    pub const KEY_R: u16 = 19;
    pub const KEY_T: u16 = 20;
    pub const KEY_Y: u16 = 21;
    pub const KEY_U: u16 = 22;
    pub const KEY_I: u16 = 23;
    pub const KEY_O: u16 = 24;
    pub const KEY_P: u16 = 25;
    pub const KEY_LEFTBRACE: u16 = 26;
    pub const KEY_RIGHTBRACE: u16 = 27;
    pub const KEY_ENTER: u16 = 28;
    pub const KEY_LEFTCTRL: u16 = 29;
    pub const KEY_A: u16 = 30;
    pub const KEY_S: u16 = 31;
    pub const KEY_D: u16 = 32;
    pub const KEY_F: u16 = 33;
    pub const KEY_G: u16 = 34;
    pub const KEY_H: u16 = 35;
    pub const KEY_J: u16 = 36;
    pub const KEY_K: u16 = 37;
    pub const KEY_L: u16 = 38;
    pub const KEY_SEMICOLON: u16 = 39;
    pub const KEY_APOSTROPHE: u16 = 40;
    pub const KEY_GRAVE: u16 = 41;
    pub const KEY_LEFTSHIFT: u16 = 42;
    pub const KEY_BACKSLASH: u16 = 43;
    pub const KEY_Z: u16 = 44;
    pub const KEY_X: u16 = 45;
    pub const KEY_C: u16 = 46;
    pub const KEY_V: u16 = 47;
    pub const KEY_B: u16 = 48;
    pub const KEY_N: u16 = 49;
    pub const KEY_M: u16 = 50;
    pub const KEY_COMMA: u16 = 51;
    pub const KEY_DOT: u16 = 52;
    pub const KEY_SLASH: u16 = 53;
    pub const KEY_RIGHTSHIFT: u16 = 54;
    pub const KEY_KPASTERISK: u16 = 55;
    pub const KEY_LEFTALT: u16 = 56;
    pub const KEY_SPACE: u16 = 57;
    pub const KEY_CAPSLOCK: u16 = 58;
    pub const KEY_F1: u16 = 59;
    pub const KEY_F2: u16 = 60;
    pub const KEY_F3: u16 = 61;
    pub const KEY_F4: u16 = 62;
    pub const KEY_F5: u16 = 63;
    pub const KEY_F6: u16 = 64;
    pub const KEY_F7: u16 = 65;
    pub const KEY_F8: u16 = 66;
    pub const KEY_F9: u16 = 67;
    pub const KEY_F10: u16 = 68;
    pub const KEY_NUMLOCK: u16 = 69;
    pub const KEY_SCROLLLOCK: u16 = 70;
    pub const KEY_KP7: u16 = 71;
    pub const KEY_KP8: u16 = 72;
    pub const KEY_KP9: u16 = 73;
    pub const KEY_KPMINUS: u16 = 74;
    pub const KEY_KP4: u16 = 75;
    pub const KEY_KP5: u16 = 76;
    pub const KEY_KP6: u16 = 77;
    pub const KEY_KPPLUS: u16 = 78;
    pub const KEY_KP1: u16 = 79;
    pub const KEY_KP2: u16 = 80;
    pub const KEY_KP3: u16 = 81;
    pub const KEY_KP0: u16 = 82;
    pub const KEY_KPDOT: u16 = 83;
    pub const KEY_102ND: u16 = 86;
    pub const KEY_F11: u16 = 87;
    pub const KEY_F12: u16 = 88;
    pub const KEY_KPENTER: u16 = 96;
    pub const KEY_RIGHTCTRL: u16 = 97;
    pub const KEY_KPSLASH: u16 = 98;
    pub const KEY_SYSRQ: u16 = 99;
    pub const KEY_RIGHTALT: u16 = 100;
    pub const KEY_HOME: u16 = 102;
    pub const KEY_UP: u16 = 103;
    pub const KEY_PAGEUP: u16 = 104;
    pub const KEY_LEFT: u16 = 105;
    pub const KEY_RIGHT: u16 = 106;
    pub const KEY_END: u16 = 107;
    pub const KEY_DOWN: u16 = 108;
    pub const KEY_PAGEDOWN: u16 = 109;
    pub const KEY_INSERT: u16 = 110;
    pub const KEY_DELETE: u16 = 111;
    pub const KEY_MUTE: u16 = 113;
    pub const KEY_VOLUMEDOWN: u16 = 114;
    pub const KEY_VOLUMEUP: u16 = 115;
    pub const KEY_POWER: u16 = 116;
    pub const KEY_KPEQUAL: u16 = 117;
    pub const KEY_PAUSE: u16 = 119;
    pub const KEY_LEFTMETA: u16 = 125;
    pub const KEY_RIGHTMETA: u16 = 126;
    pub const KEY_COMPOSE: u16 = 127;
    pub const KEY_MENU: u16 = 139;
    pub const KEY_BACK: u16 = 158;
    pub const KEY_HOMEPAGE: u16 = 172;
}

use linux::*;

static DOM_KEYCODES: &[(&str, u16)] = &[
    ("Escape", KEY_ESC),
    ("Digit1", KEY_1),
    ("Digit2", KEY_2),
    ("Digit3", KEY_3),
    ("Digit4", KEY_4),
    ("Digit5", KEY_5),
    ("Digit6", KEY_6),
    ("Digit7", KEY_7),
    ("Digit8", KEY_8),
    ("Digit9", KEY_9),
    ("Digit0", KEY_0),
    ("Minus", KEY_MINUS),
    ("Equal", KEY_EQUAL),
    ("Backspace", KEY_BACKSPACE),
    ("Tab", KEY_TAB),
    ("KeyQ", KEY_Q),
    ("KeyW", KEY_W),
    ("KeyE", KEY_E),
    ("KeyR", KEY_R),
    ("KeyT", KEY_T),
    ("KeyY", KEY_Y),
    ("KeyU", KEY_U),
    ("KeyI", KEY_I),
    ("KeyO", KEY_O),
    ("KeyP", KEY_P),
    ("BracketLeft", KEY_LEFTBRACE),
    ("BracketRight", KEY_RIGHTBRACE),
    ("Enter", KEY_ENTER),
    ("ControlLeft", KEY_LEFTCTRL),
    ("KeyA", KEY_A),
    ("KeyS", KEY_S),
    ("KeyD", KEY_D),
    ("KeyF", KEY_F),
    ("KeyG", KEY_G),
    ("KeyH", KEY_H),
    ("KeyJ", KEY_J),
    ("KeyK", KEY_K),
    ("KeyL", KEY_L),
    ("Semicolon", KEY_SEMICOLON),
    ("Quote", KEY_APOSTROPHE),
    ("Backquote", KEY_GRAVE),
    ("ShiftLeft", KEY_LEFTSHIFT),
    ("Backslash", KEY_BACKSLASH),
    ("KeyZ", KEY_Z),
    ("KeyX", KEY_X),
    ("KeyC", KEY_C),
    ("KeyV", KEY_V),
    ("KeyB", KEY_B),
    ("KeyN", KEY_N),
    ("KeyM", KEY_M),
    ("Comma", KEY_COMMA),
    ("Period", KEY_DOT),
    ("Slash", KEY_SLASH),
    ("ShiftRight", KEY_RIGHTSHIFT),
    ("NumpadMultiply", KEY_KPASTERISK),
    ("AltLeft", KEY_LEFTALT),
    ("Space", KEY_SPACE),
    ("CapsLock", KEY_CAPSLOCK),
    ("F1", KEY_F1),
    ("F2", KEY_F2),
    ("F3", KEY_F3),
    ("F4", KEY_F4),
    ("F5", KEY_F5),
    ("F6", KEY_F6),
    ("F7", KEY_F7),
    ("F8", KEY_F8),
    ("F9", KEY_F9),
    ("F10", KEY_F10),
    ("NumLock", KEY_NUMLOCK),
    ("ScrollLock", KEY_SCROLLLOCK),
    ("Numpad7", KEY_KP7),
    ("Numpad8", KEY_KP8),
    ("Numpad9", KEY_KP9),
    ("NumpadSubtract", KEY_KPMINUS),
    ("Numpad4", KEY_KP4),
    ("Numpad5", KEY_KP5),
    ("Numpad6", KEY_KP6),
    ("NumpadAdd", KEY_KPPLUS),
    ("Numpad1", KEY_KP1),
    ("Numpad2", KEY_KP2),
    ("Numpad3", KEY_KP3),
    ("Numpad0", KEY_KP0),
    ("NumpadDecimal", KEY_KPDOT),
    ("IntlBackslash", KEY_102ND),
    ("F11", KEY_F11),
    ("F12", KEY_F12),
    ("NumpadEnter", KEY_KPENTER),
    ("ControlRight", KEY_RIGHTCTRL),
    ("NumpadDivide", KEY_KPSLASH),
    ("PrintScreen", KEY_SYSRQ),
    ("AltRight", KEY_RIGHTALT),
    ("Home", KEY_HOME),
    ("ArrowUp", KEY_UP),
    ("PageUp", KEY_PAGEUP),
    ("ArrowLeft", KEY_LEFT),
    ("ArrowRight", KEY_RIGHT),
    ("End", KEY_END),
    ("ArrowDown", KEY_DOWN),
    ("PageDown", KEY_PAGEDOWN),
    ("Insert", KEY_INSERT),
    ("Delete", KEY_DELETE),
    ("AudioVolumeMute", KEY_MUTE),
    ("AudioVolumeDown", KEY_VOLUMEDOWN),
    ("AudioVolumeUp", KEY_VOLUMEUP),
    ("Power", KEY_POWER),
    ("NumpadEqual", KEY_KPEQUAL),
    ("Pause", KEY_PAUSE),
    ("MetaLeft", KEY_LEFTMETA),
    ("MetaRight", KEY_RIGHTMETA),
    ("ContextMenu", KEY_COMPOSE),
    ("BrowserBack", KEY_BACK),
    ("BrowserHome", KEY_HOMEPAGE),
];

fn table() -> &'static HashMap<&'static str, u16> {
    static TABLE: OnceLock<HashMap<&'static str, u16>> = OnceLock::new();
    TABLE.get_or_init(|| DOM_KEYCODES.iter().copied().collect())
}

/// One key for every unknown code so client input can't grow the throttler
const UNKNOWN_CODE_KEY: &str = "unknown-dom-key-code";

fn unknown_code_throttler() -> &'static LogThrottler {
    static THROTTLER: OnceLock<LogThrottler> = OnceLock::new();
    THROTTLER.get_or_init(LogThrottler::default)
}

/// Translate a DOM key code; unknown codes become `KEY_RESERVED`
pub fn dom_key_code_to_linux(code: &str) -> u16 {
    match table().get(code) {
        Some(&linux_code) => linux_code,
        None => {
            warn_throttled!(
                unknown_code_throttler(),
                UNKNOWN_CODE_KEY,
                "Unknown DOM key code: {}",
                code
            );
            KEY_RESERVED
        }
    }
}
