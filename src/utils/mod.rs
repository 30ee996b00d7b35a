//! Shared helpers for the session and channel layers

pub mod json;
pub mod throttle;

pub use json::{validate_json_object, JsonType};
pub use throttle::LogThrottler;
