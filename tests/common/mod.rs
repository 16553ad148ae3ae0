//! Shared fixtures: an in-process connection backend that records every
//! call, and a room wired to a loopback relay.

#![allow(dead_code)]

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use meshroom::connection::{
    ConnectionEvent, ConnectionFactory, PeerConnection, RemoteTrack, SessionTag, TransportState,
};
use meshroom::error::ConnectionError;
use meshroom::media::{LocalTrack, MediaCapture, MediaSourceManager, SampleTrackCapture, TrackKind};
use meshroom::room::{Room, RoomHandle, RoomInput};
use meshroom::signaling::{
    IceCandidate, LoopbackRelay, SessionDescription, SignalingChannel, SignalingMessage,
};
use meshroom::{ConferenceError, Intent, Notice};

type ConnResult<T> = Result<T, ConnectionError>;

/// Knobs that make fake connections fail.
#[derive(Default)]
pub struct Failures {
    pub offer: AtomicBool,
    pub answer: AtomicBool,
    pub remote_description: AtomicBool,
    pub candidates: AtomicBool,
    /// Peer ids whose video replacement fails.
    pub replace_for: Mutex<HashSet<String>>,
}

/// Everything one fake connection was asked to do.
#[derive(Default)]
pub struct ConnLog {
    pub added_tracks: Mutex<Vec<String>>,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    /// Candidates applied before any remote description.
    pub premature_candidates: AtomicUsize,
    pub replaced: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

impl ConnLog {
    pub fn candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn replaced(&self) -> Vec<String> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.added_tracks.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeConnection {
    peer_id: String,
    log: Arc<ConnLog>,
    failures: Arc<Failures>,
    has_remote: AtomicBool,
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> ConnResult<()> {
        self.log.added_tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> ConnResult<SessionDescription> {
        if self.failures.offer.load(Ordering::SeqCst) {
            return Err(ConnectionError::Other("offer refused".into()));
        }
        self.log.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-for-{}", self.peer_id)))
    }

    async fn create_answer(&self) -> ConnResult<SessionDescription> {
        if self.failures.answer.load(Ordering::SeqCst) {
            return Err(ConnectionError::Other("answer refused".into()));
        }
        self.log.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer_id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> ConnResult<()> {
        if self.failures.remote_description.load(Ordering::SeqCst) {
            return Err(ConnectionError::InvalidDescription("unparseable sdp".into()));
        }
        self.log.remote_descriptions.lock().unwrap().push(desc);
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ConnResult<()> {
        if !self.has_remote.load(Ordering::SeqCst) {
            self.log.premature_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(ConnectionError::Other("no remote description".into()));
        }
        if self.failures.candidates.load(Ordering::SeqCst) {
            return Err(ConnectionError::Other("candidate rejected".into()));
        }
        self.log.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> ConnResult<()> {
        if self.failures.replace_for.lock().unwrap().contains(&self.peer_id) {
            return Err(ConnectionError::NoVideoSender);
        }
        self.log.replaced.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> ConnResult<()> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Created {
    tag: SessionTag,
    log: Arc<ConnLog>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Connection backend that hands out recording fakes.
#[derive(Default)]
pub struct FakeFactory {
    pub failures: Arc<Failures>,
    created: Mutex<Vec<Created>>,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(
        &self,
        tag: SessionTag,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnResult<Box<dyn PeerConnection>> {
        let log = Arc::new(ConnLog::default());
        self.created.lock().unwrap().push(Created {
            tag: tag.clone(),
            log: Arc::clone(&log),
            events,
        });
        Ok(Box::new(FakeConnection {
            peer_id: tag.peer_id,
            log,
            failures: Arc::clone(&self.failures),
            has_remote: AtomicBool::new(false),
        }))
    }
}

impl FakeFactory {
    /// Log of the most recent connection created for `peer_id`.
    pub fn log(&self, peer_id: &str) -> Arc<ConnLog> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.tag.peer_id == peer_id)
            .map(|c| Arc::clone(&c.log))
            .unwrap_or_else(|| panic!("no connection created for {peer_id}"))
    }

    pub fn connections_for(&self, peer_id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tag.peer_id == peer_id)
            .count()
    }

    pub fn tags(&self, peer_id: &str) -> Vec<SessionTag> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tag.peer_id == peer_id)
            .map(|c| c.tag.clone())
            .collect()
    }

    /// Emit an event the way a connection callback would.
    pub fn emit(&self, event: ConnectionEvent) {
        let created = self.created.lock().unwrap();
        let target = created
            .iter()
            .find(|c| &c.tag == event.tag())
            .expect("event for a connection that was never created");
        target.events.send(event).unwrap();
    }

    fn latest_tag(&self, peer_id: &str) -> SessionTag {
        self.tags(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("no connection created for {peer_id}"))
    }

    pub fn emit_track(&self, peer_id: &str, track_id: &str, kind: TrackKind) {
        self.emit(ConnectionEvent::RemoteTrack {
            tag: self.latest_tag(peer_id),
            track: RemoteTrack {
                id: track_id.to_string(),
                kind,
                stream_id: format!("{peer_id}-stream"),
            },
        });
    }

    pub fn emit_local_candidate(&self, peer_id: &str, candidate: &str) {
        self.emit(ConnectionEvent::LocalCandidate {
            tag: self.latest_tag(peer_id),
            candidate: IceCandidate::new(candidate),
        });
    }

    pub fn emit_state(&self, peer_id: &str, state: TransportState) {
        self.emit(ConnectionEvent::StateChanged {
            tag: self.latest_tag(peer_id),
            state,
        });
    }
}

/// Capture whose camera and microphone are unavailable.
pub struct NoDevices;

#[async_trait]
impl MediaCapture for NoDevices {
    async fn user_media(&self) -> meshroom::Result<meshroom::media::LocalStream> {
        Err(ConferenceError::MediaAccess("Permission denied".into()))
    }

    async fn display_media(&self) -> meshroom::Result<meshroom::media::LocalStream> {
        Err(ConferenceError::MediaAccess("Permission denied".into()))
    }
}

pub struct Harness {
    pub room: Room,
    pub handle: RoomHandle,
    pub relay: LoopbackRelay,
    pub factory: Arc<FakeFactory>,
    pub notices: broadcast::Receiver<Notice>,
}

pub const LOCAL_NAME: &str = "Ana";

pub async fn join() -> Harness {
    join_with(Arc::new(SampleTrackCapture::default())).await
}

pub async fn join_with(capture: Arc<dyn MediaCapture>) -> Harness {
    let media = MediaSourceManager::open(capture).await.unwrap();
    join_with_media(media).await
}

pub async fn join_with_media(media: MediaSourceManager) -> Harness {
    let (channel, relay) = SignalingChannel::loopback(256);
    let factory = Arc::new(FakeFactory::default());
    let (room, handle) = Room::new("standup", LOCAL_NAME, channel, media, factory.clone());
    let notices = handle.notices();
    Harness {
        room,
        handle,
        relay,
        factory,
        notices,
    }
}

impl Harness {
    /// Deliver a relay message and process everything that becomes ready.
    pub async fn deliver(&mut self, msg: SignalingMessage) -> ControlFlow<meshroom::Result<()>> {
        self.relay.deliver(msg).await.unwrap();
        self.settle().await
    }

    pub async fn settle(&mut self) -> ControlFlow<meshroom::Result<()>> {
        self.room.drain_ready().await
    }

    pub async fn intent(&mut self, intent: Intent) -> ControlFlow<meshroom::Result<()>> {
        let flow = self.room.dispatch(RoomInput::Intent(intent)).await;
        if flow.is_break() {
            return flow;
        }
        self.settle().await
    }

    /// Messages the client sent since the last call.
    pub fn sent(&mut self) -> Vec<SignalingMessage> {
        self.relay.drain()
    }

    pub fn notices(&mut self) -> Vec<Notice> {
        std::iter::from_fn(|| self.notices.try_recv().ok()).collect()
    }

    /// Bring a peer we initiated towards up to `Connected`.
    pub async fn connect_initiated(&mut self, peer_id: &str) {
        let _ = self.deliver(new_peer(peer_id)).await;
        let _ = self.deliver(answer(peer_id)).await;
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.room.registry().ids()
    }
}

pub fn new_peer(peer_id: &str) -> SignalingMessage {
    SignalingMessage::NewPeer {
        peer_id: peer_id.to_string(),
        display_name: Some(format!("{peer_id}-name")),
    }
}

pub fn offer(peer_id: &str) -> SignalingMessage {
    SignalingMessage::Offer {
        peer_id: peer_id.to_string(),
        offer: SessionDescription::offer(format!("offer-from-{peer_id}")),
        display_name: Some(format!("{peer_id}-name")),
    }
}

pub fn answer(peer_id: &str) -> SignalingMessage {
    SignalingMessage::Answer {
        peer_id: peer_id.to_string(),
        answer: SessionDescription::answer(format!("answer-from-{peer_id}")),
    }
}

pub fn candidate(peer_id: &str, candidate: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        peer_id: peer_id.to_string(),
        candidate: IceCandidate::new(candidate),
    }
}

pub fn peer_left(peer_id: &str) -> SignalingMessage {
    SignalingMessage::PeerLeft {
        peer_id: peer_id.to_string(),
    }
}
