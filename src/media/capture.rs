//! Local media acquisition.

use async_trait::async_trait;
use tracing::debug;

use super::track::{LocalStream, LocalTrack, TrackKind};
use crate::error::{ConferenceError, Result};

/// Platform capability for capturing local media. Either call may be
/// denied by the user or the platform, reported as `MediaAccess`.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Camera plus microphone.
    async fn user_media(&self) -> Result<LocalStream>;

    /// Display capture for screen sharing. Must carry a video track.
    async fn display_media(&self) -> Result<LocalStream>;
}

/// Capture backed by sample-fed webrtc-rs tracks.
///
/// The tracks are created empty; whoever owns the encoder pushes samples
/// through [`LocalTrack::write_sample`].
#[derive(Debug, Clone)]
pub struct SampleTrackCapture {
    allow_display: bool,
}

impl SampleTrackCapture {
    pub fn new(allow_display: bool) -> Self {
        Self { allow_display }
    }
}

impl Default for SampleTrackCapture {
    fn default() -> Self {
        Self::new(true)
    }
}

fn stream_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::random::<u32>())
}

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn user_media(&self) -> Result<LocalStream> {
        let id = stream_id("local");
        debug!(stream_id = %id, "Creating camera and microphone tracks");
        Ok(LocalStream::new(
            id.clone(),
            Some(LocalTrack::new(TrackKind::Audio, format!("{id}-audio"), &id)),
            Some(LocalTrack::new(TrackKind::Video, format!("{id}-camera"), &id)),
        ))
    }

    async fn display_media(&self) -> Result<LocalStream> {
        if !self.allow_display {
            return Err(ConferenceError::MediaAccess(
                "display capture is not permitted".to_string(),
            ));
        }
        let id = stream_id("screen");
        debug!(stream_id = %id, "Creating screen track");
        Ok(LocalStream::new(
            id.clone(),
            None,
            Some(LocalTrack::new(TrackKind::Video, format!("{id}-video"), &id)),
        ))
    }
}
