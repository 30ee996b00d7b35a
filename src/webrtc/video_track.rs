//! Stable handle to the client's inbound video
//!
//! The device side wants a single place to attach its video sink (for
//! example the camera HAL), while the engine creates and destroys the
//! underlying track on every renegotiation. [`ClientVideoTrack`] remembers
//! the sink and binds it to whichever track is current.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::engine::{SinkWants, VideoSink, VideoTrack};

#[derive(Default)]
struct Inner {
    sink: Option<Arc<dyn VideoSink>>,
    wants: SinkWants,
    /// The engine owns the track; only observe it
    track: Option<Weak<dyn VideoTrack>>,
}

#[derive(Default)]
pub struct ClientVideoTrack {
    inner: Mutex<Inner>,
}

impl ClientVideoTrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the sink, attaching it to the current track if any
    pub fn add_or_update_sink(&self, sink: Arc<dyn VideoSink>, wants: SinkWants) {
        let mut inner = self.inner.lock();
        inner.sink = Some(sink.clone());
        inner.wants = wants;
        if let Some(track) = inner.track.as_ref().and_then(Weak::upgrade) {
            track.add_or_update_sink(sink, wants);
        }
    }

    /// Bind a newly announced track, attaching an already registered sink
    pub fn set_video_track(&self, track: &Arc<dyn VideoTrack>) {
        let mut inner = self.inner.lock();
        inner.track = Some(Arc::downgrade(track));
        if let Some(sink) = inner.sink.clone() {
            track.add_or_update_sink(sink, inner.wants);
        }
        debug!("Client video track bound: {}", track.id());
    }

    /// Unbind `track`, unless a different track has replaced it since
    pub fn unset_video_track(&self, track: &Arc<dyn VideoTrack>) {
        let mut inner = self.inner.lock();
        let current = inner
            .track
            .as_ref()
            .is_some_and(|bound| std::ptr::addr_eq(bound.as_ptr(), Arc::as_ptr(track)));
        if current {
            inner.track = None;
            debug!("Client video track unbound: {}", track.id());
        } else {
            debug!("Ignoring removal of stale video track {}", track.id());
        }
    }

    /// Whether a live track is currently bound
    pub fn has_video_track(&self) -> bool {
        self.inner
            .lock()
            .track
            .as_ref()
            .is_some_and(|t| t.strong_count() > 0)
    }
}
