//! Camera data channel reassembly
//!
//! The client streams one capture as a sequence of binary fragments and
//! terminates it with a frame containing exactly `EOF`.

use parking_lot::Mutex;
use tracing::warn;

/// End-of-capture marker
pub const CAMERA_DATA_EOF: &[u8] = b"EOF";

#[derive(Default)]
struct CaptureState {
    buffer: Vec<u8>,
    /// The current capture exceeded the cap and will be dropped at EOF
    overflowed: bool,
}

pub struct CameraReceiver {
    state: Mutex<CaptureState>,
    max_capture_bytes: usize,
}

impl CameraReceiver {
    pub fn new(max_capture_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CaptureState::default()),
            max_capture_bytes,
        }
    }

    /// Feed one frame; returns the completed capture on the end marker
    pub fn push(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();

        if data == CAMERA_DATA_EOF {
            let capture = std::mem::take(&mut state.buffer);
            if std::mem::take(&mut state.overflowed) {
                return None;
            }
            return Some(capture);
        }

        if state.overflowed {
            return None;
        }
        if state.buffer.len() + data.len() > self.max_capture_bytes {
            warn!(
                "Camera capture exceeds {} bytes, dropping it",
                self.max_capture_bytes
            );
            state.buffer = Vec::new();
            state.overflowed = true;
            return None;
        }

        state.buffer.extend_from_slice(data);
        None
    }

    /// Bytes accumulated for the in-flight capture
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.state.lock().buffer.len()
    }
}
