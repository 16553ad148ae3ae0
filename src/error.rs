//! Error types for the conference orchestrator.
//!
//! Per-peer errors are reported as notices and never abort the room.
//! Only [`ConferenceError::SignalingConnection`] (and an explicit leave)
//! tears the whole room down.

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Orchestrator-level error taxonomy.
#[derive(Debug, Error)]
pub enum ConferenceError {
    /// Capture denied or unavailable. Recoverable; the feature is disabled.
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Signaling transport dropped. The room is unusable and must be rejoined.
    #[error("Signaling connection error: {0}")]
    SignalingConnection(#[from] SignalingError),

    /// One outbound message could not be handed to the relay. The inbound
    /// stream decides whether the room survives.
    #[error("Failed to send {kind} to peer {peer_id}: {source}")]
    SignalingSend {
        peer_id: String,
        kind: &'static str,
        source: SignalingError,
    },

    /// Malformed or out-of-order offer/answer exchange for one peer.
    #[error("Negotiation error for peer {peer_id}: {reason}")]
    Negotiation { peer_id: String, reason: String },

    /// `new-peer` or `offer` for an id that already has a session.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// Connection object rejected a remote candidate.
    #[error("ICE candidate rejected for peer {peer_id}: {reason}")]
    IceApplication { peer_id: String, reason: String },

    /// Outbound video replacement failed on one session.
    #[error("Track replacement failed for peer {peer_id}: {reason}")]
    TrackReplacement { peer_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The connection backend could not be set up.
    #[error("Connection setup error: {0}")]
    Connection(#[from] ConnectionError),

    /// The room task has stopped; intents can no longer be delivered.
    #[error("Room closed")]
    RoomClosed,
}

impl ConferenceError {
    pub(crate) fn negotiation(peer_id: &str, reason: impl ToString) -> Self {
        Self::Negotiation {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error ends the room.
    pub fn is_room_fatal(&self) -> bool {
        matches!(self, Self::SignalingConnection(_))
    }

    /// The peer this error is scoped to, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Negotiation { peer_id, .. }
            | Self::IceApplication { peer_id, .. }
            | Self::TrackReplacement { peer_id, .. }
            | Self::SignalingSend { peer_id, .. } => Some(peer_id),
            Self::DuplicatePeer(peer_id) => Some(peer_id),
            Self::MediaAccess(_)
            | Self::SignalingConnection(_)
            | Self::Config(_)
            | Self::Connection(_)
            | Self::RoomClosed => None,
        }
    }
}

/// Signaling transport errors.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("WebSocket error: {0}")]
    Connect(#[from] WsError),

    #[error("Malformed signaling message: {0}")]
    Decode(String),

    #[error("Failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reported by a connection object.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("No outbound video sender")]
    NoVideoSender,

    #[error("Connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required value: {0}")]
    Missing(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConferenceError>;
