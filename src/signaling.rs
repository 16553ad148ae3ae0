//! Signaling wire format and the per-room duplex channel.
//!
//! The relay speaks JSON objects tagged by `type`:
//! `new-peer`, `offer`, `answer`, `ice-candidate`, `peer-left` and the
//! additive `media-state`. Inbound, `peerId` names the sender; outbound it
//! names the target.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::SignalingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// `RTCSessionDescriptionInit` as browsers serialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// `RTCIceCandidateInit` as browsers serialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// A peer joined after us; we initiate towards it.
    #[serde(rename_all = "camelCase")]
    NewPeer {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_id: String,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_id: String,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    #[serde(rename_all = "camelCase")]
    MediaState {
        peer_id: String,
        #[serde(default)]
        is_muted: bool,
        #[serde(default)]
        is_camera_off: bool,
        #[serde(default)]
        is_screen_sharing: bool,
    },
}

impl SignalingMessage {
    pub fn peer_id(&self) -> &str {
        match self {
            Self::NewPeer { peer_id, .. }
            | Self::Offer { peer_id, .. }
            | Self::Answer { peer_id, .. }
            | Self::IceCandidate { peer_id, .. }
            | Self::PeerLeft { peer_id }
            | Self::MediaState { peer_id, .. } => peer_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewPeer { .. } => "new-peer",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::PeerLeft { .. } => "peer-left",
            Self::MediaState { .. } => "media-state",
        }
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound item: a decoded message, or a report that one could not be decoded.
pub type Inbound = Result<SignalingMessage, SignalingError>;

/// Cloneable outbound half of a [`SignalingChannel`].
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::Sender<SignalingMessage>,
}

impl SignalingSender {
    /// Queue a message for the relay. Fails with `ChannelClosed` once the
    /// transport is gone.
    pub async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SignalingError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Duplex message transport bound to one room.
///
/// Inbound delivery is a single-consumer stream; it ends when the transport
/// closes and cannot be restarted.
pub struct SignalingChannel {
    sender: SignalingSender,
    inbound: mpsc::Receiver<Inbound>,
}

impl SignalingChannel {
    /// Open the relay WebSocket at `url`.
    pub async fn connect(url: &str, buffer: usize) -> Result<Self, SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "Signaling connected");
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(buffer);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalingMessage>(buffer);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match msg.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping unencodable {} message: {}", msg.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Signaling writer stopped");
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = inbound_tx.send(Err(SignalingError::Decode(e.to_string()))).await;
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Relay closed the signaling socket");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                };
                if inbound_tx.send(SignalingMessage::decode(&text)).await.is_err() {
                    break;
                }
            }
            debug!("Signaling reader stopped");
        });

        Ok(Self::from_parts(outgoing_tx, inbound_rx))
    }

    /// Build a channel over caller-provided queues.
    pub fn from_parts(
        outbound: mpsc::Sender<SignalingMessage>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        Self {
            sender: SignalingSender { tx: outbound },
            inbound,
        }
    }

    /// A channel whose far end is held in process, standing in for the relay.
    pub fn loopback(buffer: usize) -> (Self, LoopbackRelay) {
        let (to_client, inbound) = mpsc::channel(buffer);
        let (outbound, from_client) = mpsc::channel(buffer);
        (
            Self::from_parts(outbound, inbound),
            LoopbackRelay {
                to_client: Some(to_client),
                from_client,
            },
        )
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Next inbound item, or `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (SignalingSender, mpsc::Receiver<Inbound>) {
        (self.sender, self.inbound)
    }
}

/// Relay side of [`SignalingChannel::loopback`].
pub struct LoopbackRelay {
    to_client: Option<mpsc::Sender<Inbound>>,
    from_client: mpsc::Receiver<SignalingMessage>,
}

impl LoopbackRelay {
    /// Push a message to the client.
    pub async fn deliver(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.push(Ok(msg)).await
    }

    /// Push raw relay text to the client, decoding it the way the socket reader does.
    pub async fn deliver_text(&self, text: &str) -> Result<(), SignalingError> {
        self.push(SignalingMessage::decode(text)).await
    }

    async fn push(&self, item: Inbound) -> Result<(), SignalingError> {
        match &self.to_client {
            Some(tx) => tx.send(item).await.map_err(|_| SignalingError::ChannelClosed),
            None => Err(SignalingError::ChannelClosed),
        }
    }

    /// Next message the client sent, if one is already queued.
    pub fn try_next(&mut self) -> Option<SignalingMessage> {
        self.from_client.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<SignalingMessage> {
        self.from_client.recv().await
    }

    /// Drain everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Simulate the relay dropping the inbound direction.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Stop accepting client messages; later sends fail with `ChannelClosed`.
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }
}
