//! The conference room: one task owns the peer registry, the negotiation
//! engine and local media, and reacts to three input queues (inbound
//! signaling, user intents and connection completions) one item at a time.
//!
//! The presentation layer never touches that state directly. It sends
//! [`Intent`]s through a [`RoomHandle`] and renders the [`RoomSnapshot`]s
//! published after every processed input.

mod negotiation;
mod registry;
mod session;
mod view;

pub use negotiation::NegotiationEngine;
pub use registry::PeerRegistry;
pub use session::{
    CandidateOutcome, NegotiationRole, NegotiationState, PeerSession, PeerSummary, RemoteStream,
};
pub use view::{compose_view, grid_shape, Tile, ViewState, MAX_VISIBLE_PEERS};

use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConferenceConfig;
use crate::connection::{ConnectionEvent, ConnectionFactory};
use crate::error::{ConferenceError, Result, SignalingError};
use crate::media::{LocalTrack, MediaSourceManager, MediaSourceState, VideoSource};
use crate::rtc::RtcConnectionFactory;
use crate::signaling::{Inbound, SignalingChannel};

const INTENT_BUFFER: usize = 32;
const NOTICE_BUFFER: usize = 64;

/// A user action, applied by the room task in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ToggleMic,
    ToggleCamera,
    ToggleScreenShare,
    /// Focus a peer; focusing the already focused peer unfocuses.
    FocusPeer(String),
    ClearFocus,
    Leave,
}

/// Everything the room task reacts to.
#[derive(Debug)]
pub enum RoomInput {
    Signaling(Inbound),
    SignalingClosed,
    Intent(Intent),
    Connection(ConnectionEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Joined,
    /// The participant left; everything is closed.
    Left,
    /// Signaling was lost; the room must be rejoined.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    MediaAccess,
    SignalingLost,
    SendFailed,
    Negotiation,
    DuplicatePeer,
    IceApplication,
    TrackReplacement,
    MalformedMessage,
    UnknownPeer,
    Internal,
}

/// A non-fatal event worth showing the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub kind: NoticeKind,
    pub peer_id: Option<String>,
    pub message: String,
}

impl From<&ConferenceError> for Notice {
    fn from(err: &ConferenceError) -> Self {
        let kind = match err {
            ConferenceError::MediaAccess(_) => NoticeKind::MediaAccess,
            ConferenceError::SignalingConnection(_) => NoticeKind::SignalingLost,
            ConferenceError::SignalingSend { .. } => NoticeKind::SendFailed,
            ConferenceError::Negotiation { .. } => NoticeKind::Negotiation,
            ConferenceError::DuplicatePeer(_) => NoticeKind::DuplicatePeer,
            ConferenceError::IceApplication { .. } => NoticeKind::IceApplication,
            ConferenceError::TrackReplacement { .. } => NoticeKind::TrackReplacement,
            ConferenceError::Config(_)
            | ConferenceError::Connection(_)
            | ConferenceError::RoomClosed => NoticeKind::Internal,
        };
        Self {
            kind,
            peer_id: err.peer_id().map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub display_name: String,
    pub phase: RoomPhase,
    /// Participants in join order.
    pub peers: Vec<PeerSummary>,
    pub media: MediaSourceState,
    /// What the local self-view tile shows.
    pub local_source: VideoSource,
    pub view: ViewState,
}

/// Cloneable control surface for a running [`Room`].
#[derive(Clone)]
pub struct RoomHandle {
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<RoomSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl RoomHandle {
    pub async fn send(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| ConferenceError::RoomClosed)
    }

    pub async fn toggle_mic(&self) -> Result<()> {
        self.send(Intent::ToggleMic).await
    }

    pub async fn toggle_camera(&self) -> Result<()> {
        self.send(Intent::ToggleCamera).await
    }

    pub async fn toggle_screen_share(&self) -> Result<()> {
        self.send(Intent::ToggleScreenShare).await
    }

    pub async fn focus_peer(&self, peer_id: impl Into<String>) -> Result<()> {
        self.send(Intent::FocusPeer(peer_id.into())).await
    }

    pub async fn clear_focus(&self) -> Result<()> {
        self.send(Intent::ClearFocus).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(Intent::Leave).await
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshots.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

pub struct Room {
    room_id: String,
    display_name: String,
    phase: RoomPhase,
    registry: PeerRegistry,
    engine: NegotiationEngine,
    media: MediaSourceManager,
    focused_peer_id: Option<String>,
    signaling_rx: mpsc::Receiver<Inbound>,
    intents_rx: mpsc::Receiver<Intent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    snapshot_tx: watch::Sender<RoomSnapshot>,
    notice_tx: broadcast::Sender<Notice>,
}

impl Room {
    /// Enter a room over an already open signaling channel. `media` carries
    /// over whatever was toggled during preview.
    pub fn new(
        room_id: impl Into<String>,
        display_name: impl Into<String>,
        channel: SignalingChannel,
        media: MediaSourceManager,
        factory: Arc<dyn ConnectionFactory>,
    ) -> (Self, RoomHandle) {
        let room_id = room_id.into();
        let display_name = display_name.into();
        let (signaling, signaling_rx) = channel.into_parts();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_BUFFER);
        let (notice_tx, _) = broadcast::channel(NOTICE_BUFFER);

        let engine = NegotiationEngine::new(factory, signaling, events_tx, display_name.clone());
        let registry = PeerRegistry::new();
        let initial = RoomSnapshot {
            room_id: room_id.clone(),
            display_name: display_name.clone(),
            phase: RoomPhase::Joined,
            peers: Vec::new(),
            media: media.state(),
            local_source: media.active_video_source(),
            view: compose_view(registry.all(), None),
        };
        let (snapshot_tx, snapshots) = watch::channel(initial);

        info!(room_id = %room_id, display_name = %display_name, "Joined room");
        let handle = RoomHandle {
            intents: intents_tx,
            snapshots,
            notices: notice_tx.clone(),
        };
        let room = Self {
            room_id,
            display_name,
            phase: RoomPhase::Joined,
            registry,
            engine,
            media,
            focused_peer_id: None,
            signaling_rx,
            intents_rx,
            events_rx,
            snapshot_tx,
            notice_tx,
        };
        (room, handle)
    }

    /// Connect to the relay for `room_id` and enter it with WebRTC connections.
    pub async fn join(
        config: &ConferenceConfig,
        room_id: &str,
        media: MediaSourceManager,
    ) -> Result<(Self, RoomHandle)> {
        config.validate()?;
        let url = config.room_url(room_id)?;
        let channel = SignalingChannel::connect(&url, config.signaling_buffer).await?;
        let factory = RtcConnectionFactory::new(&config.stun_servers)?;
        Ok(Self::new(
            room_id,
            config.display_name.clone(),
            channel,
            media,
            Arc::new(factory),
        ))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn media(&self) -> &MediaSourceManager {
        &self.media
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub fn focused_peer_id(&self) -> Option<&str> {
        self.focused_peer_id.as_deref()
    }

    /// Process inputs until the participant leaves or signaling is lost.
    /// Dropping every [`RoomHandle`] counts as leaving.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let input = tokio::select! {
                inbound = self.signaling_rx.recv() => match inbound {
                    Some(item) => RoomInput::Signaling(item),
                    None => RoomInput::SignalingClosed,
                },
                intent = self.intents_rx.recv() => RoomInput::Intent(intent.unwrap_or(Intent::Leave)),
                Some(event) = self.events_rx.recv() => RoomInput::Connection(event),
            };
            if let ControlFlow::Break(result) = self.dispatch(input).await {
                return result;
            }
        }
    }

    /// Process whatever is already queued without waiting. Signaling is
    /// drained first, then connection completions, then intents.
    pub async fn drain_ready(&mut self) -> ControlFlow<Result<()>> {
        loop {
            let input = match self.signaling_rx.try_recv() {
                Ok(item) => RoomInput::Signaling(item),
                Err(TryRecvError::Disconnected) => RoomInput::SignalingClosed,
                Err(TryRecvError::Empty) => {
                    if let Ok(event) = self.events_rx.try_recv() {
                        RoomInput::Connection(event)
                    } else if let Ok(intent) = self.intents_rx.try_recv() {
                        RoomInput::Intent(intent)
                    } else {
                        return ControlFlow::Continue(());
                    }
                }
            };
            if let ControlFlow::Break(result) = self.dispatch(input).await {
                return ControlFlow::Break(result);
            }
        }
    }

    /// Apply one input to completion, then publish the resulting snapshot.
    pub async fn dispatch(&mut self, input: RoomInput) -> ControlFlow<Result<()>> {
        if self.phase != RoomPhase::Joined {
            debug!(?input, "Room is closed; input ignored");
            return ControlFlow::Break(Ok(()));
        }

        let flow = match input {
            RoomInput::Signaling(Ok(msg)) => {
                self.engine
                    .handle_signaling(msg, &mut self.registry, &self.media)
                    .await;
                ControlFlow::Continue(())
            }
            RoomInput::Signaling(Err(e)) => {
                warn!("Ignoring undecodable signaling message: {}", e);
                self.notify(Notice {
                    kind: NoticeKind::MalformedMessage,
                    peer_id: None,
                    message: e.to_string(),
                });
                ControlFlow::Continue(())
            }
            RoomInput::SignalingClosed => {
                error!(room_id = %self.room_id, "Signaling connection lost");
                self.teardown(RoomPhase::Disconnected).await;
                let err = ConferenceError::SignalingConnection(SignalingError::ChannelClosed);
                self.notify((&err).into());
                ControlFlow::Break(Err(err))
            }
            RoomInput::Intent(intent) => self.apply_intent(intent).await,
            RoomInput::Connection(event) => {
                self.engine
                    .handle_connection_event(event, &mut self.registry)
                    .await;
                ControlFlow::Continue(())
            }
        };

        self.settle();
        flow
    }

    async fn apply_intent(&mut self, intent: Intent) -> ControlFlow<Result<()>> {
        debug!(?intent, "Applying intent");
        let result = match intent {
            Intent::ToggleMic => match self.media.toggle_mic() {
                Ok(enabled) => {
                    info!(enabled, "Microphone");
                    self.announce_media().await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Intent::ToggleCamera => match self.media.toggle_camera() {
                Ok(enabled) => {
                    info!(enabled, "Camera");
                    self.announce_media().await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Intent::ToggleScreenShare => {
                if self.media.is_screen_sharing() {
                    self.stop_screen_share().await
                } else {
                    self.start_screen_share().await
                }
            }
            Intent::FocusPeer(peer_id) => {
                self.focus(peer_id);
                Ok(())
            }
            Intent::ClearFocus => {
                self.focused_peer_id = None;
                Ok(())
            }
            Intent::Leave => {
                info!(room_id = %self.room_id, "Leaving room");
                self.teardown(RoomPhase::Left).await;
                return ControlFlow::Break(Ok(()));
            }
        };

        if let Err(e) = result {
            warn!("{}", e);
            self.notify((&e).into());
        }
        ControlFlow::Continue(())
    }

    fn focus(&mut self, peer_id: String) {
        if self.focused_peer_id.as_deref() == Some(peer_id.as_str()) {
            self.focused_peer_id = None;
        } else if self.registry.contains(&peer_id) {
            self.focused_peer_id = Some(peer_id);
        } else {
            self.notify(Notice {
                kind: NoticeKind::UnknownPeer,
                message: format!("Cannot focus unknown peer {peer_id}"),
                peer_id: Some(peer_id),
            });
        }
    }

    /// Switch every session's outbound video to a new display capture. Either
    /// all sessions switch or none do.
    async fn start_screen_share(&mut self) -> Result<()> {
        let stream = self.media.acquire_screen().await?;
        let (Some(screen), Some(camera)) = (
            stream.video().cloned(),
            self.media.camera_track().cloned(),
        ) else {
            stream.stop();
            return Err(ConferenceError::MediaAccess(
                "screen sharing needs both a camera and a display track".to_string(),
            ));
        };

        let results = replace_video_everywhere(&mut self.registry, &screen).await;
        let (switched, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|(_, r)| r.is_ok());

        if failed.is_empty() {
            self.media.commit_screen(stream);
            info!(sessions = switched.len(), "Screen share started");
            self.announce_media().await;
            return Ok(());
        }

        warn!(
            switched = switched.len(),
            failed = failed.len(),
            "Screen share fan-out failed; rolling back"
        );
        for session in self.registry.all_mut() {
            if switched.iter().any(|(id, _)| id == session.id()) {
                if let Err(e) = session.replace_outbound_video(Arc::clone(&camera)).await {
                    warn!(peer_id = session.id(), "Rollback to camera failed: {}", e);
                }
            }
        }
        stream.stop();

        let mut errors = failed.into_iter().filter_map(|(peer_id, r)| {
            r.err().map(|e| ConferenceError::TrackReplacement {
                peer_id,
                reason: e.to_string(),
            })
        });
        let first = errors.next();
        for extra in errors {
            self.notify((&extra).into());
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Put the camera back on every session and release the display capture.
    async fn stop_screen_share(&mut self) -> Result<()> {
        let Some(camera) = self.media.camera_track().cloned() else {
            self.media.release_screen();
            return Ok(());
        };

        let results = replace_video_everywhere(&mut self.registry, &camera).await;
        self.media.release_screen();
        info!("Screen share stopped");

        for (peer_id, result) in results {
            if let Err(e) = result {
                let err = ConferenceError::TrackReplacement {
                    peer_id,
                    reason: e.to_string(),
                };
                warn!("{}", err);
                self.notify((&err).into());
            }
        }
        self.announce_media().await;
        Ok(())
    }

    async fn announce_media(&mut self) {
        let state = self.media.state();
        self.engine.announce_media(&self.registry, &state).await;
    }

    async fn teardown(&mut self, phase: RoomPhase) {
        self.engine.reset();
        self.registry.close_all().await;
        self.media.release_all();
        self.focused_peer_id = None;
        self.phase = phase;
    }

    /// Post-input bookkeeping: drop a dead focus, surface reports, publish.
    fn settle(&mut self) {
        if let Some(focused) = &self.focused_peer_id {
            if !self.registry.contains(focused) {
                debug!(peer_id = %focused, "Focused peer left; clearing focus");
                self.focused_peer_id = None;
            }
        }
        for err in self.engine.take_reports() {
            self.notify((&err).into());
        }
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notice_tx.send(notice);
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            display_name: self.display_name.clone(),
            phase: self.phase,
            peers: self.registry.all().iter().map(PeerSession::summary).collect(),
            media: self.media.state(),
            local_source: self.media.active_video_source(),
            view: compose_view(self.registry.all(), self.focused_peer_id.as_deref()),
        }
    }
}

/// Replace the outbound video on every session concurrently.
async fn replace_video_everywhere(
    registry: &mut PeerRegistry,
    track: &Arc<LocalTrack>,
) -> Vec<(String, std::result::Result<(), crate::error::ConnectionError>)> {
    join_all(registry.all_mut().map(|session| {
        let track = Arc::clone(track);
        async move {
            let peer_id = session.id().to_string();
            let result = session.replace_outbound_video(track).await;
            (peer_id, result)
        }
    }))
    .await
}
