//! vdev-webrtc - WebRTC session layer for virtual devices
//!
//! Connects browser clients to a virtual device over WebRTC: signaling,
//! ICE candidate buffering, the device's data channel protocols and the
//! client camera feed. The device itself plugs in through
//! [`observer::ConnectionObserver`].

pub mod channels;
pub mod config;
pub mod error;
pub mod observer;
pub mod state;
pub mod utils;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
