//! webrtc-rs backed connection objects.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{
    ConnectionEvent, ConnectionFactory, PeerConnection, RemoteTrack, SessionTag, TransportState,
};
use crate::error::ConnectionError;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// Builds one `RTCPeerConnection` per remote participant.
pub struct RtcConnectionFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnectionFactory {
    pub fn new(stun_servers: &[String]) -> Result<Self, ConnectionError> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn connect(
        &self,
        tag: SessionTag,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>, ConnectionError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let candidate_tag = tag.clone();
        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tag = candidate_tag.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::LocalCandidate {
                            tag,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => warn!(peer_id = %tag.peer_id, "Unserializable local candidate: {}", e),
                }
            })
        }));

        let track_tag = tag.clone();
        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let tag = track_tag.clone();
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                    };
                    let _ = events.send(ConnectionEvent::RemoteTrack { tag, track: remote });

                    // Keep the receive path flowing until the track ends.
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                })
            },
        ));

        let state_tag = tag.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tag = state_tag.clone();
                let events = events.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };
                    debug!(peer_id = %tag.peer_id, %state, "Peer connection state changed");
                    let _ = events.send(ConnectionEvent::StateChanged { tag, state });
                })
            },
        ));

        info!(peer_id = %tag.peer_id, epoch = tag.epoch, "Peer connection created");
        Ok(Box::new(RtcConnection {
            peer_connection,
            video_sender: Mutex::new(None),
        }))
    }
}

pub struct RtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(ConnectionError::InvalidDescription(
                "rollback is not supported".to_string(),
            ))
        }
    };
    Ok(rtc)
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError> {
        let sender = self
            .peer_connection
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(Arc::clone(&sender));
        }

        // Read incoming RTCP so interceptors (NACK, reports) keep working.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError> {
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or(ConnectionError::NoVideoSender)?;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
