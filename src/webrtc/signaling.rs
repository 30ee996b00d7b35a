//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::IceServer;
use crate::error::{AppError, Result};

/// Envelopes received from the client over the signaling transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Client asks the device to build the connection and send an offer
    #[serde(alias = "offer-request")]
    RequestOffer {
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    /// Client-initiated negotiation
    Offer { sdp: String },
    /// Reply to a device offer
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    /// Error reported by the client; logged only
    Error {
        #[serde(default)]
        error: String,
    },
}

impl ClientMessage {
    /// Decode an inbound envelope
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get("type") {
            Some(Value::String(_)) => {}
            _ => {
                return Err(AppError::BadRequest(
                    "Message is missing a string field named 'type'".to_string(),
                ))
            }
        }
        serde_json::from_value(value)
            .map_err(|e| AppError::BadRequest(format!("Invalid signaling message: {}", e)))
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RequestOffer { .. } => "request-offer",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate(_) => "ice-candidate",
            ClientMessage::Error { .. } => "error",
        }
    }
}

/// Envelopes sent from the device to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeviceMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    Error { error: String },
}

impl DeviceMessage {
    pub fn error(message: impl Into<String>) -> Self {
        DeviceMessage::Error {
            error: message.into(),
        }
    }

    /// Package a locally created description
    pub fn description(desc: &SessionDescription) -> Self {
        match desc.sdp_type {
            SdpType::Offer => DeviceMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SdpType::Answer => DeviceMessage::Answer {
                sdp: desc.sdp.clone(),
            },
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// SDP media id
    pub mid: String,
    /// Index of the media section the candidate belongs to
    #[serde(rename = "mLineIndex")]
    pub m_line_index: u16,
    /// Candidate attribute line
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(mid: impl Into<String>, m_line_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            mid: mid.into(),
            m_line_index,
            candidate: candidate.into(),
        }
    }
}

/// Description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// Session description as exchanged with the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

impl std::fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceGatheringState::New => write!(f, "new"),
            IceGatheringState::Gathering => write!(f, "gathering"),
            IceGatheringState::Complete => write!(f, "complete"),
        }
    }
}
