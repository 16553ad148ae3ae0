//! One remote participant and the connection object that reaches it.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{PeerConnection, RemoteTrack, SessionTag, TransportState};
use crate::error::ConnectionError;
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    /// We create the offer.
    Initiator,
    /// We answer the peer's offer.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "Idle"),
            NegotiationState::Negotiating => write!(f, "Negotiating"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}

/// Remote media, built up as tracks arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Record a track; returns false if it was already known.
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// What happened to a remote candidate handed to a session.
#[derive(Debug)]
pub enum CandidateOutcome {
    /// No remote description yet; held until one is applied.
    Queued,
    Applied,
    Rejected(ConnectionError),
}

/// Read-only view of a session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub display_name: String,
    pub role: NegotiationRole,
    pub state: NegotiationState,
    pub transport: TransportState,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_screen_sharing: bool,
    pub remote_tracks: Vec<RemoteTrack>,
}

pub struct PeerSession {
    tag: SessionTag,
    connection: Box<dyn PeerConnection>,
    remote_stream: RemoteStream,
    display_name: String,
    is_muted: bool,
    is_camera_off: bool,
    is_screen_sharing: bool,
    role: NegotiationRole,
    state: NegotiationState,
    transport: TransportState,
    has_remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
    outbound_video: Option<Weak<LocalTrack>>,
}

impl PeerSession {
    pub fn new(
        tag: SessionTag,
        display_name: impl Into<String>,
        role: NegotiationRole,
        connection: Box<dyn PeerConnection>,
    ) -> Self {
        Self {
            tag,
            connection,
            remote_stream: RemoteStream::default(),
            display_name: display_name.into(),
            is_muted: false,
            is_camera_off: false,
            is_screen_sharing: false,
            role,
            state: NegotiationState::Idle,
            transport: TransportState::New,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            outbound_video: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.tag.peer_id
    }

    pub fn tag(&self) -> &SessionTag {
        &self.tag
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn connection(&self) -> &dyn PeerConnection {
        self.connection.as_ref()
    }

    /// Id of the local video track this session currently sends, if that
    /// track is still alive.
    pub fn outbound_video_id(&self) -> Option<String> {
        self.outbound_video
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|t| t.id().to_string())
    }

    pub(crate) fn set_role(&mut self, role: NegotiationRole) {
        self.role = role;
    }

    pub(crate) fn set_state(&mut self, state: NegotiationState) {
        if self.state == state {
            return;
        }
        debug!(peer_id = %self.tag.peer_id, from = %self.state, to = %state, "Negotiation state");
        self.state = state;
    }

    pub(crate) fn set_transport(&mut self, transport: TransportState) {
        self.transport = transport;
    }

    pub(crate) fn set_media_flags(&mut self, muted: bool, camera_off: bool, screen_sharing: bool) {
        self.is_muted = muted;
        self.is_camera_off = camera_off;
        self.is_screen_sharing = screen_sharing;
    }

    pub(crate) fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        self.remote_stream.add(track)
    }

    /// Bind every given local track for sending.
    pub(crate) async fn bind_tracks(&mut self, tracks: &[Arc<LocalTrack>]) -> Result<(), ConnectionError> {
        for track in tracks {
            self.connection.add_track(Arc::clone(track)).await?;
            if track.kind() == crate::media::TrackKind::Video {
                self.outbound_video = Some(Arc::downgrade(track));
            }
        }
        Ok(())
    }

    pub(crate) async fn replace_outbound_video(&mut self, track: Arc<LocalTrack>) -> Result<(), ConnectionError> {
        self.connection.replace_video_track(Arc::clone(&track)).await?;
        self.outbound_video = Some(Arc::downgrade(&track));
        Ok(())
    }

    /// Hold candidates that arrived before this session existed.
    pub(crate) fn enqueue_candidates(&mut self, candidates: Vec<IceCandidate>) {
        self.pending_candidates.extend(candidates);
    }

    /// Apply the remote description, then drain queued candidates in arrival
    /// order. Each queued candidate is applied once; rejections are returned.
    pub(crate) async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<Vec<ConnectionError>, ConnectionError> {
        self.connection.set_remote_description(desc).await?;
        self.has_remote_description = true;

        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!(peer_id = %self.tag.peer_id, count = queued.len(), "Flushing queued candidates");
        }
        let mut rejected = Vec::new();
        for candidate in queued {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                rejected.push(e);
            }
        }
        Ok(rejected)
    }

    pub(crate) async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        if !self.has_remote_description {
            self.pending_candidates.push(candidate);
            return CandidateOutcome::Queued;
        }
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) => CandidateOutcome::Rejected(e),
        }
    }

    /// Close the connection. Runs at most once per session.
    pub(crate) async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.set_state(NegotiationState::Closed);
        self.pending_candidates.clear();
        if let Err(e) = self.connection.close().await {
            warn!(peer_id = %self.tag.peer_id, "Error closing connection: {}", e);
        }
        self.transport = TransportState::Closed;
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.tag.peer_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            state: self.state,
            transport: self.transport,
            is_muted: self.is_muted,
            is_camera_off: self.is_camera_off,
            is_screen_sharing: self.is_screen_sharing,
            remote_tracks: self.remote_stream.tracks().to_vec(),
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("tag", &self.tag)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("has_remote_description", &self.has_remote_description)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}
