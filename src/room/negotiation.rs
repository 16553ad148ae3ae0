//! Per-peer offer/answer/ICE state machine.
//!
//! Roles come from the relay: a `new-peer` makes us the initiator towards
//! that peer, an `offer` makes us the responder. No local tie-break is
//! applied.
//!
//! Every handler runs to completion before the room takes its next input.
//! Per-peer failures are collected with [`NegotiationEngine::take_reports`]
//! and never stop the room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::registry::PeerRegistry;
use super::session::{CandidateOutcome, NegotiationRole, NegotiationState, PeerSession};
use crate::connection::{ConnectionEvent, ConnectionFactory, SessionTag};
use crate::error::{ConferenceError, Result};
use crate::media::{MediaSourceManager, MediaSourceState};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription, SignalingMessage, SignalingSender};

pub struct NegotiationEngine {
    factory: Arc<dyn ConnectionFactory>,
    signaling: SignalingSender,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    local_name: String,
    next_epoch: u64,
    /// Candidates for peer ids that have no session yet.
    early_candidates: HashMap<String, Vec<IceCandidate>>,
    /// Peers whose last attempt failed. Their trailing candidates belong to
    /// the dead attempt and are dropped until a new one starts.
    abandoned: HashSet<String>,
    reports: Vec<ConferenceError>,
}

impl NegotiationEngine {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        signaling: SignalingSender,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            signaling,
            events,
            local_name: local_name.into(),
            next_epoch: 0,
            early_candidates: HashMap::new(),
            abandoned: HashSet::new(),
            reports: Vec::new(),
        }
    }

    /// Errors collected since the last call.
    pub fn take_reports(&mut self) -> Vec<ConferenceError> {
        std::mem::take(&mut self.reports)
    }

    fn report(&mut self, err: ConferenceError) {
        match &err {
            ConferenceError::DuplicatePeer(_) => warn!("Protocol anomaly: {}", err),
            _ => warn!("{}", err),
        }
        self.reports.push(err);
    }

    /// Candidates still waiting for a session to exist.
    pub fn early_candidates(&self, peer_id: &str) -> usize {
        self.early_candidates.get(peer_id).map_or(0, Vec::len)
    }

    /// Drop all buffered state; used on room teardown.
    pub fn reset(&mut self) {
        self.early_candidates.clear();
        self.abandoned.clear();
    }

    /// Apply one inbound signaling message.
    #[instrument(skip_all, fields(kind = msg.kind(), peer_id = msg.peer_id()))]
    pub async fn handle_signaling(
        &mut self,
        msg: SignalingMessage,
        registry: &mut PeerRegistry,
        media: &MediaSourceManager,
    ) {
        let result = match msg {
            SignalingMessage::NewPeer {
                peer_id,
                display_name,
            } => self.on_new_peer(peer_id, display_name, registry, media).await,
            SignalingMessage::Offer {
                peer_id,
                offer,
                display_name,
            } => self.on_offer(peer_id, offer, display_name, registry, media).await,
            SignalingMessage::Answer { peer_id, answer } => {
                self.on_answer(&peer_id, answer, registry).await
            }
            SignalingMessage::IceCandidate { peer_id, candidate } => {
                self.on_ice_candidate(peer_id, candidate, registry).await
            }
            SignalingMessage::PeerLeft { peer_id } => {
                self.on_peer_left(&peer_id, registry).await;
                Ok(())
            }
            SignalingMessage::MediaState {
                peer_id,
                is_muted,
                is_camera_off,
                is_screen_sharing,
            } => {
                match registry.get_mut(&peer_id) {
                    Some(session) => session.set_media_flags(is_muted, is_camera_off, is_screen_sharing),
                    None => debug!("Media state for unknown peer ignored"),
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    async fn on_new_peer(
        &mut self,
        peer_id: String,
        display_name: Option<String>,
        registry: &mut PeerRegistry,
        media: &MediaSourceManager,
    ) -> Result<()> {
        if registry.contains(&peer_id) {
            return Err(ConferenceError::DuplicatePeer(peer_id));
        }

        let name = display_name.unwrap_or_else(|| peer_id.clone());
        self.open_session(&peer_id, name, NegotiationRole::Initiator, registry, media)
            .await?;

        let Some(session) = registry.get_mut(&peer_id) else {
            return Ok(());
        };
        let offer = match session.connection().create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.discard(&peer_id, registry).await;
                return Err(ConferenceError::negotiation(&peer_id, format!("creating offer: {e}")));
            }
        };
        session.set_state(NegotiationState::Negotiating);
        info!(peer_id = %peer_id, "Sending offer");

        self.send(SignalingMessage::Offer {
            peer_id: peer_id.clone(),
            offer,
            display_name: Some(self.local_name.clone()),
        })
        .await;
        self.announce_media_to(&peer_id, &media.state()).await;
        Ok(())
    }

    async fn on_offer(
        &mut self,
        peer_id: String,
        offer: SessionDescription,
        display_name: Option<String>,
        registry: &mut PeerRegistry,
        media: &MediaSourceManager,
    ) -> Result<()> {
        if offer.kind != SdpKind::Offer {
            return Err(ConferenceError::negotiation(
                &peer_id,
                format!("offer message carried a {:?} description", offer.kind),
            ));
        }

        let renegotiating = match registry.get(&peer_id) {
            Some(session) if session.state() == NegotiationState::Connected => true,
            Some(_) => return Err(ConferenceError::DuplicatePeer(peer_id)),
            None => false,
        };

        if !renegotiating {
            let name = display_name.unwrap_or_else(|| peer_id.clone());
            self.open_session(&peer_id, name, NegotiationRole::Responder, registry, media)
                .await?;
        }

        let Some(session) = registry.get_mut(&peer_id) else {
            return Ok(());
        };

        let rejected = match session.apply_remote_description(offer).await {
            Ok(rejected) => rejected,
            Err(e) => {
                if !renegotiating {
                    self.discard(&peer_id, registry).await;
                }
                return Err(ConferenceError::negotiation(&peer_id, format!("applying offer: {e}")));
            }
        };
        for e in rejected {
            self.report(ConferenceError::IceApplication {
                peer_id: peer_id.clone(),
                reason: e.to_string(),
            });
        }

        let answer = match session.connection().create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                if !renegotiating {
                    self.discard(&peer_id, registry).await;
                }
                return Err(ConferenceError::negotiation(&peer_id, format!("creating answer: {e}")));
            }
        };
        session.set_role(NegotiationRole::Responder);
        if !renegotiating {
            session.set_state(NegotiationState::Negotiating);
        }
        info!(peer_id = %peer_id, renegotiating, "Sending answer");

        self.send(SignalingMessage::Answer {
            peer_id: peer_id.clone(),
            answer,
        })
        .await;
        if !renegotiating {
            self.announce_media_to(&peer_id, &media.state()).await;
        }
        Ok(())
    }

    async fn on_answer(
        &mut self,
        peer_id: &str,
        answer: SessionDescription,
        registry: &mut PeerRegistry,
    ) -> Result<()> {
        let session = registry
            .get_mut(peer_id)
            .ok_or_else(|| ConferenceError::negotiation(peer_id, "answer for unknown peer"))?;

        if session.state() != NegotiationState::Negotiating
            || session.role() != NegotiationRole::Initiator
            || session.has_remote_description()
        {
            return Err(ConferenceError::negotiation(
                peer_id,
                format!(
                    "unexpected answer ({:?} session in state {})",
                    session.role(),
                    session.state()
                ),
            ));
        }
        if answer.kind != SdpKind::Answer {
            return Err(ConferenceError::negotiation(
                peer_id,
                format!("answer message carried a {:?} description", answer.kind),
            ));
        }

        let rejected = session
            .apply_remote_description(answer)
            .await
            .map_err(|e| ConferenceError::negotiation(peer_id, format!("applying answer: {e}")))?;
        session.set_state(NegotiationState::Connected);
        info!(peer_id, "Answer applied");

        for e in rejected {
            self.report(ConferenceError::IceApplication {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn on_ice_candidate(
        &mut self,
        peer_id: String,
        candidate: IceCandidate,
        registry: &mut PeerRegistry,
    ) -> Result<()> {
        let Some(session) = registry.get_mut(&peer_id) else {
            if self.abandoned.contains(&peer_id) {
                debug!("Candidate for a failed attempt dropped");
                return Ok(());
            }
            debug!("Holding candidate until the session exists");
            self.early_candidates.entry(peer_id).or_default().push(candidate);
            return Ok(());
        };

        match session.add_remote_candidate(candidate).await {
            CandidateOutcome::Queued => {
                debug!(queued = session.pending_candidates(), "Candidate queued");
                Ok(())
            }
            CandidateOutcome::Applied => Ok(()),
            CandidateOutcome::Rejected(e) => Err(ConferenceError::IceApplication {
                peer_id,
                reason: e.to_string(),
            }),
        }
    }

    async fn on_peer_left(&mut self, peer_id: &str, registry: &mut PeerRegistry) {
        self.early_candidates.remove(peer_id);
        self.abandoned.remove(peer_id);
        if !registry.remove(peer_id).await {
            debug!("Peer already gone");
        }
    }

    /// Close a session whose negotiation failed and forget its candidates.
    async fn discard(&mut self, peer_id: &str, registry: &mut PeerRegistry) {
        self.abandon(peer_id);
        registry.remove(peer_id).await;
    }

    fn abandon(&mut self, peer_id: &str) {
        self.early_candidates.remove(peer_id);
        self.abandoned.insert(peer_id.to_string());
    }

    /// Apply a completion reported by a connection object. Events from a
    /// session that has since been replaced or removed are ignored.
    pub async fn handle_connection_event(&mut self, event: ConnectionEvent, registry: &mut PeerRegistry) {
        let tag = event.tag().clone();
        let Some(session) = registry.get_mut(&tag.peer_id) else {
            debug!(peer_id = %tag.peer_id, "Event for departed peer ignored");
            return;
        };
        if session.tag() != &tag {
            debug!(peer_id = %tag.peer_id, epoch = tag.epoch, "Stale connection event ignored");
            return;
        }

        match event {
            ConnectionEvent::LocalCandidate { candidate, .. } => {
                self.send(SignalingMessage::IceCandidate {
                    peer_id: tag.peer_id,
                    candidate,
                })
                .await;
            }
            ConnectionEvent::RemoteTrack { track, .. } => {
                let track_id = track.id.clone();
                if session.add_remote_track(track) {
                    debug!(peer_id = %tag.peer_id, track_id = %track_id, "Remote track arrived");
                }
                if session.state() == NegotiationState::Negotiating && session.has_remote_description() {
                    session.set_state(NegotiationState::Connected);
                    info!(peer_id = %tag.peer_id, "Peer connected");
                }
            }
            ConnectionEvent::StateChanged { state, .. } => {
                session.set_transport(state);
                if state == crate::connection::TransportState::Failed {
                    warn!(peer_id = %tag.peer_id, "Transport failed; no ICE restart is attempted");
                }
            }
        }
    }

    /// Tell every peer about a local mic/camera/screen change.
    pub async fn announce_media(&mut self, registry: &PeerRegistry, state: &MediaSourceState) {
        for peer_id in registry.ids() {
            self.announce_media_to(&peer_id, state).await;
        }
    }

    async fn announce_media_to(&mut self, peer_id: &str, state: &MediaSourceState) {
        self.send(SignalingMessage::MediaState {
            peer_id: peer_id.to_string(),
            is_muted: !state.mic_enabled,
            is_camera_off: !state.camera_enabled,
            is_screen_sharing: state.screen_sharing,
        })
        .await;
    }

    /// Create a connection object, bind the active local tracks and register
    /// the session. Buffered early candidates move into it, or are dropped
    /// if the session cannot be opened.
    async fn open_session(
        &mut self,
        peer_id: &str,
        display_name: String,
        role: NegotiationRole,
        registry: &mut PeerRegistry,
        media: &MediaSourceManager,
    ) -> Result<()> {
        self.abandoned.remove(peer_id);
        let tag = SessionTag {
            peer_id: peer_id.to_string(),
            epoch: self.next_epoch,
        };
        self.next_epoch += 1;

        let connection = match self.factory.connect(tag.clone(), self.events.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                self.abandon(peer_id);
                return Err(ConferenceError::negotiation(peer_id, format!("creating connection: {e}")));
            }
        };

        let mut session = PeerSession::new(tag, display_name, role, connection);
        if let Err(e) = session.bind_tracks(&media.outbound_tracks()).await {
            session.close().await;
            self.abandon(peer_id);
            return Err(ConferenceError::negotiation(peer_id, format!("binding local tracks: {e}")));
        }
        if let Some(early) = self.early_candidates.remove(peer_id) {
            session.enqueue_candidates(early);
        }

        registry.upsert(session).await?;
        info!(peer_id, ?role, "Session opened");
        Ok(())
    }

    /// Outbound sends never abort event processing; a closed channel is reported.
    async fn send(&mut self, msg: SignalingMessage) {
        let kind = msg.kind();
        let peer_id = msg.peer_id().to_string();
        if let Err(source) = self.signaling.send(msg).await {
            warn!(kind, peer_id = %peer_id, "Signaling send failed: {}", source);
            self.reports.push(ConferenceError::SignalingSend {
                peer_id,
                kind,
                source,
            });
        }
    }
}
