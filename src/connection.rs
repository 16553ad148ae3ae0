//! Connection-object seam.
//!
//! A [`PeerConnection`] is the per-peer media connection; a
//! [`ConnectionFactory`] builds one and routes its asynchronous callbacks
//! (gathered candidates, arriving remote tracks, transport state) into the
//! room's completion queue as [`ConnectionEvent`]s.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};

/// Transport-level state reported by the connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "New"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Disconnected => write!(f, "Disconnected"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

/// Identifies one connection object. `epoch` distinguishes a session from a
/// later one created for the same peer id, so late callbacks from a closed
/// connection are recognisable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    pub peer_id: String,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A local candidate was gathered and should trickle to the peer.
    LocalCandidate { tag: SessionTag, candidate: IceCandidate },
    RemoteTrack { tag: SessionTag, track: RemoteTrack },
    StateChanged { tag: SessionTag, state: TransportState },
}

impl ConnectionEvent {
    pub fn tag(&self) -> &SessionTag {
        match self {
            Self::LocalCandidate { tag, .. }
            | Self::RemoteTrack { tag, .. }
            | Self::StateChanged { tag, .. } => tag,
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Bind a local track for sending.
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Swap the outbound video source without renegotiating.
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        tag: SessionTag,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>, ConnectionError>;
}
