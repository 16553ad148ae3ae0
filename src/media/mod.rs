//! Local media sources: the camera/microphone capture and an optional
//! screen capture, with exactly one of camera or screen active as the
//! outbound video at any time.
//!
//! The manager only owns capture resources. Writing a new video source into
//! live connections is the room's job; the manager hands out the source
//! (`acquire_screen`) and records the switch once every connection has
//! taken it (`commit_screen`).

mod capture;
mod track;

pub use capture::{MediaCapture, SampleTrackCapture};
pub use track::{LocalStream, LocalTrack, TrackKind};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConferenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSourceState {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub active_video_source: VideoSource,
    pub screen_sharing: bool,
}

pub struct MediaSourceManager {
    capture: Arc<dyn MediaCapture>,
    local: Option<LocalStream>,
    screen: Option<LocalStream>,
}

impl MediaSourceManager {
    /// Acquire camera and microphone. This is the preview stage: toggles made
    /// here carry over into the room.
    pub async fn open(capture: Arc<dyn MediaCapture>) -> Result<Self> {
        let local = capture.user_media().await?;
        info!(
            stream_id = local.id(),
            audio = local.audio().is_some(),
            video = local.video().is_some(),
            "Local media acquired"
        );
        Ok(Self {
            capture,
            local: Some(local),
            screen: None,
        })
    }

    /// A manager with no local capture; the participant only receives.
    pub fn receive_only(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            local: None,
            screen: None,
        }
    }

    pub fn mic_track(&self) -> Option<&Arc<LocalTrack>> {
        self.local.as_ref().and_then(LocalStream::audio)
    }

    pub fn camera_track(&self) -> Option<&Arc<LocalTrack>> {
        self.local.as_ref().and_then(LocalStream::video)
    }

    pub fn screen_track(&self) -> Option<&Arc<LocalTrack>> {
        self.screen.as_ref().and_then(LocalStream::video)
    }

    pub fn active_video_source(&self) -> VideoSource {
        if self.screen_track().is_some() {
            VideoSource::Screen
        } else {
            VideoSource::Camera
        }
    }

    /// The video track currently bound into outbound connections.
    pub fn active_video_track(&self) -> Option<&Arc<LocalTrack>> {
        match self.active_video_source() {
            VideoSource::Screen => self.screen_track(),
            VideoSource::Camera => self.camera_track(),
        }
    }

    /// Everything a new connection should send: microphone and the active video.
    pub fn outbound_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.mic_track()
            .into_iter()
            .chain(self.active_video_track())
            .cloned()
            .collect()
    }

    pub fn state(&self) -> MediaSourceState {
        MediaSourceState {
            mic_enabled: self.mic_track().is_some_and(|t| t.is_enabled()),
            camera_enabled: self.camera_track().is_some_and(|t| t.is_enabled()),
            active_video_source: self.active_video_source(),
            screen_sharing: self.screen.is_some(),
        }
    }

    pub fn toggle_mic(&self) -> Result<bool> {
        let track = self
            .mic_track()
            .ok_or_else(|| ConferenceError::MediaAccess("no microphone".to_string()))?;
        let enabled = track.toggle();
        debug!(enabled, "Microphone toggled");
        Ok(enabled)
    }

    pub fn toggle_camera(&self) -> Result<bool> {
        let track = self
            .camera_track()
            .ok_or_else(|| ConferenceError::MediaAccess("no camera".to_string()))?;
        let enabled = track.toggle();
        debug!(enabled, "Camera toggled");
        Ok(enabled)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Request a display capture without changing the active source.
    pub async fn acquire_screen(&self) -> Result<LocalStream> {
        if self.camera_track().is_none() {
            return Err(ConferenceError::MediaAccess(
                "screen sharing needs an outbound video track".to_string(),
            ));
        }
        let stream = self.capture.display_media().await?;
        if stream.video().is_none() {
            stream.stop();
            return Err(ConferenceError::MediaAccess(
                "display capture returned no video".to_string(),
            ));
        }
        Ok(stream)
    }

    /// Make an acquired screen capture the active video source.
    pub fn commit_screen(&mut self, stream: LocalStream) {
        if let Some(previous) = self.screen.replace(stream) {
            warn!(stream_id = previous.id(), "Replacing an active screen capture");
            previous.stop();
        }
        info!("Screen share active");
    }

    /// Release the screen capture and fall back to the camera.
    pub fn release_screen(&mut self) -> Option<LocalStream> {
        let stream = self.screen.take()?;
        stream.stop();
        info!(stream_id = stream.id(), "Screen share released");
        Some(stream)
    }

    /// Stop every capture source.
    pub fn release_all(&mut self) {
        self.release_screen();
        if let Some(local) = self.local.take() {
            local.stop();
            info!(stream_id = local.id(), "Local media released");
        }
    }
}
