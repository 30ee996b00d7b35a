//! Byte passthrough channels (ADB, bluetooth and the location variants)
//!
//! These channels are only reported open to the device once the client
//! actually sends something, so backends such as the ADB bridge are not
//! started for clients that never use them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::error::{AppError, Result};
use crate::observer::PassthroughKind;
use crate::webrtc::engine::{DataBuffer, DataChannel};

pub struct PassthroughReceiver {
    kind: PassthroughKind,
    open_reported: AtomicBool,
}

impl PassthroughReceiver {
    pub fn new(kind: PassthroughKind) -> Self {
        Self {
            kind,
            open_reported: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> PassthroughKind {
        self.kind
    }

    /// `true` exactly once, for the first inbound message
    pub fn take_first_message(&self) -> bool {
        !self.open_reported.swap(true, Ordering::AcqRel)
    }
}

/// Device side writer for a passthrough channel
///
/// Frames are sent binary. A send that would push the channel's outbound
/// buffer past `max_buffered` is rejected with [`AppError::Backpressure`]
/// instead of being queued, since SCTP closes channels whose buffer fills.
#[derive(Clone)]
pub struct ChannelSender {
    channel: Weak<dyn DataChannel>,
    label: String,
    max_buffered: usize,
}

impl ChannelSender {
    pub fn new(channel: &Arc<dyn DataChannel>, max_buffered: usize) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            label: channel.label().to_string(),
            max_buffered,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let channel = self.channel.upgrade().ok_or_else(|| {
            AppError::ChannelError(format!("Channel '{}' is closed", self.label))
        })?;

        let buffered = channel.buffered_amount().await;
        if buffered + data.len() > self.max_buffered {
            return Err(AppError::Backpressure {
                label: self.label.clone(),
                buffered,
                limit: self.max_buffered,
            });
        }

        channel
            .send(DataBuffer::binary(Bytes::copy_from_slice(data)))
            .await
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("label", &self.label)
            .field("max_buffered", &self.max_buffered)
            .finish()
    }
}
