//! WebRTC session layer
//!
//! Architecture:
//! ```text
//! Client <---- signaling (WebSocket) ----> WebRtcSessionManager
//!                                                |
//!                                                v
//!                                          ClientHandler (one task per client)
//!                                                |
//!                       +------------------------+----------------------+
//!                       |                        |                      |
//!                       v                        v                      v
//!               OperationsChain          channel handlers        ClientVideoTrack
//!               (engine calls)        (input, control, camera,   (camera proxy)
//!                       |                 passthrough)
//!                       v
//!               PeerConnection (engine seam, webrtc-rs in `peer`)
//! ```

pub mod client_handler;
pub mod config;
pub mod engine;
pub mod mdns;
pub mod operations;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod video_track;

#[cfg(test)]
pub mod testing;

pub use client_handler::{ClientHandler, ConnectionChange};
pub use config::{IceServer, WebRtcConfig};
pub use engine::{PeerConnection, PeerConnectionBuilder, PeerEvent, PeerEventSink};
pub use peer::RtcPeerConnectionBuilder;
pub use session::{SessionInfo, WebRtcSessionManager};
pub use signaling::{ClientMessage, ConnectionState, DeviceMessage, IceCandidate};
pub use video_track::ClientVideoTrack;
