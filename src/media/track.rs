//! Local capture tracks.
//!
//! A [`LocalTrack`] is shared by reference between the media manager and
//! every outbound connection, so flipping its enabled flag is seen by all
//! of them at once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));

        Arc::new(Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag in place, returning the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Release the capture source. A stopped track never produces media again.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The webrtc-rs track bound into connection objects.
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Feed one encoded sample. Disabled or stopped tracks swallow it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), ConnectionError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A group of local tracks from one capture request.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(
        id: impl Into<String>,
        audio: Option<Arc<LocalTrack>>,
        video: Option<Arc<LocalTrack>>,
    ) -> Self {
        Self {
            id: id.into(),
            audio,
            video,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}
