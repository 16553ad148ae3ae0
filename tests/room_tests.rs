//! Room-level behavior: media switching, focus, leave and signaling loss.

mod common;

use common::*;
use std::ops::ControlFlow;
use std::sync::Arc;

use meshroom::media::{MediaSourceManager, SampleTrackCapture, VideoSource};
use meshroom::room::{NegotiationState, MAX_VISIBLE_PEERS};
use meshroom::signaling::SignalingMessage;
use meshroom::{ConferenceError, Intent, NoticeKind, RoomPhase};

async fn room_with(peers: &[&str]) -> Harness {
    let mut h = join().await;
    for peer in peers {
        h.connect_initiated(peer).await;
    }
    h.sent();
    h
}

fn screen_flags(sent: &[SignalingMessage]) -> Vec<(String, bool)> {
    sent.iter()
        .filter_map(|m| match m {
            SignalingMessage::MediaState {
                peer_id,
                is_screen_sharing,
                ..
            } => Some((peer_id.clone(), *is_screen_sharing)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn screen_share_replaces_video_once_per_session() {
    let mut h = room_with(&["p1", "p2", "p3"]).await;
    let camera_id = h.room.media().camera_track().unwrap().id().to_string();

    let _ = h.intent(Intent::ToggleScreenShare).await;
    let screen = Arc::clone(h.room.media().screen_track().unwrap());
    for peer in ["p1", "p2", "p3"] {
        assert_eq!(h.factory.log(peer).replaced(), vec![screen.id().to_string()], "{peer}");
    }
    let snapshot = h.room.snapshot();
    assert_eq!(snapshot.local_source, VideoSource::Screen);
    assert!(snapshot.media.screen_sharing);
    assert_eq!(
        screen_flags(&h.sent()),
        vec![("p1".into(), true), ("p2".into(), true), ("p3".into(), true)]
    );

    let _ = h.intent(Intent::ToggleScreenShare).await;
    for peer in ["p1", "p2", "p3"] {
        assert_eq!(
            h.factory.log(peer).replaced(),
            vec![screen.id().to_string(), camera_id.clone()],
            "{peer}"
        );
    }
    assert!(screen.is_stopped());
    assert_eq!(h.room.snapshot().local_source, VideoSource::Camera);
    assert!(screen_flags(&h.sent()).iter().all(|(_, sharing)| !sharing));
    assert!(h.notices().is_empty());
}

#[tokio::test]
async fn session_opened_during_share_sends_the_screen() {
    let mut h = room_with(&["p1"]).await;
    let _ = h.intent(Intent::ToggleScreenShare).await;
    let screen_id = h.room.media().screen_track().unwrap().id().to_string();
    let camera_id = h.room.media().camera_track().unwrap().id().to_string();

    let _ = h.deliver(new_peer("p4")).await;
    let log = h.factory.log("p4");
    assert!(log.added_tracks().contains(&screen_id));
    assert!(!log.added_tracks().contains(&camera_id));
    assert!(log.replaced().is_empty());

    let sent = h.sent();
    assert!(sent.iter().any(|m| matches!(
        m,
        SignalingMessage::MediaState { peer_id, is_screen_sharing: true, .. } if peer_id == "p4"
    )));
}

#[tokio::test]
async fn failed_replacement_rolls_every_session_back_to_camera() {
    let mut h = room_with(&["p1", "p2", "p3"]).await;
    let camera_id = h.room.media().camera_track().unwrap().id().to_string();
    h.factory
        .failures
        .replace_for
        .lock()
        .unwrap()
        .insert("p2".to_string());

    let _ = h.intent(Intent::ToggleScreenShare).await;

    for peer in ["p1", "p3"] {
        let replaced = h.factory.log(peer).replaced();
        assert_eq!(replaced.len(), 2, "{peer}");
        assert_eq!(replaced[1], camera_id, "{peer} rolled back");
    }
    assert!(h.factory.log("p2").replaced().is_empty());
    assert!(!h.room.media().is_screen_sharing());
    assert_eq!(h.room.snapshot().local_source, VideoSource::Camera);
    assert!(h.sent().is_empty(), "nothing announced for a failed share");

    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::TrackReplacement);
    assert_eq!(notices[0].peer_id.as_deref(), Some("p2"));
}

#[tokio::test]
async fn failed_replacement_on_stop_still_ends_the_share() {
    let mut h = room_with(&["p1", "p2"]).await;
    let camera_id = h.room.media().camera_track().unwrap().id().to_string();
    let _ = h.intent(Intent::ToggleScreenShare).await;
    let screen = Arc::clone(h.room.media().screen_track().unwrap());
    h.sent();
    h.notices();
    h.factory
        .failures
        .replace_for
        .lock()
        .unwrap()
        .insert("p2".to_string());

    let flow = h.intent(Intent::ToggleScreenShare).await;
    assert!(flow.is_continue());

    assert_eq!(
        h.factory.log("p1").replaced(),
        vec![screen.id().to_string(), camera_id]
    );
    assert!(screen.is_stopped());
    assert!(!h.room.media().is_screen_sharing());
    assert_eq!(h.room.snapshot().local_source, VideoSource::Camera);
    assert_eq!(
        screen_flags(&h.sent()),
        vec![("p1".into(), false), ("p2".into(), false)]
    );

    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::TrackReplacement);
    assert_eq!(notices[0].peer_id.as_deref(), Some("p2"));
}

#[tokio::test]
async fn denied_display_capture_changes_nothing() {
    let mut h = join_with(Arc::new(SampleTrackCapture::new(false))).await;
    h.connect_initiated("p1").await;
    h.sent();

    let flow = h.intent(Intent::ToggleScreenShare).await;
    assert!(flow.is_continue());
    assert!(h.factory.log("p1").replaced().is_empty());
    assert_eq!(h.room.snapshot().local_source, VideoSource::Camera);
    assert!(h.sent().is_empty());
    assert_eq!(h.notices()[0].kind, NoticeKind::MediaAccess);
}

#[tokio::test]
async fn mic_and_camera_toggles_are_announced() {
    let mut h = room_with(&["p1", "p2"]).await;

    let _ = h.intent(Intent::ToggleMic).await;
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| matches!(
        m,
        SignalingMessage::MediaState { is_muted: true, is_camera_off: false, .. }
    )));
    assert!(!h.room.snapshot().media.mic_enabled);

    let _ = h.intent(Intent::ToggleCamera).await;
    assert!(h.sent().iter().all(|m| matches!(
        m,
        SignalingMessage::MediaState { is_muted: true, is_camera_off: true, .. }
    )));
    assert!(!h.room.media().camera_track().unwrap().is_enabled());
}

#[tokio::test]
async fn preview_toggles_carry_into_the_room() {
    let media = MediaSourceManager::open(Arc::new(SampleTrackCapture::default()))
        .await
        .unwrap();
    media.toggle_mic().unwrap();
    let mut h = join_with_media(media).await;
    assert!(!h.handle.snapshot().media.mic_enabled);

    let _ = h.deliver(new_peer("p1")).await;
    let sent = h.sent();
    assert!(matches!(
        &sent[1],
        SignalingMessage::MediaState { is_muted: true, is_camera_off: false, .. }
    ));
}

#[tokio::test]
async fn receive_only_participant_still_negotiates() {
    let media = MediaSourceManager::receive_only(Arc::new(NoDevices));
    let mut h = join_with_media(media).await;

    let _ = h.deliver(new_peer("p1")).await;
    assert!(h.factory.log("p1").added_tracks().is_empty());
    assert!(matches!(&h.sent()[0], SignalingMessage::Offer { .. }));

    let _ = h.intent(Intent::ToggleMic).await;
    let _ = h.intent(Intent::ToggleScreenShare).await;
    let kinds: Vec<_> = h.notices().into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::MediaAccess, NoticeKind::MediaAccess]);
}

#[tokio::test]
async fn leave_mid_negotiation_closes_everything() {
    let mut h = join().await;
    let _ = h.deliver(new_peer("p1")).await;
    let _ = h.deliver(offer("p2")).await;
    h.connect_initiated("p3").await;
    let _ = h.deliver(candidate("p9", "early")).await;
    let mic = Arc::clone(h.room.media().mic_track().unwrap());
    let camera = Arc::clone(h.room.media().camera_track().unwrap());
    assert_eq!(
        h.room.registry().get("p1").unwrap().state(),
        NegotiationState::Negotiating
    );

    let flow = h.intent(Intent::Leave).await;
    assert!(matches!(flow, ControlFlow::Break(Ok(()))));

    for peer in ["p1", "p2", "p3"] {
        assert_eq!(h.factory.log(peer).closes(), 1, "{peer}");
    }
    assert!(h.room.registry().is_empty());
    assert_eq!(h.room.engine().early_candidates("p9"), 0);
    assert!(mic.is_stopped() && camera.is_stopped());
    assert_eq!(h.room.phase(), RoomPhase::Left);
    assert_eq!(h.handle.snapshot().phase, RoomPhase::Left);
    assert!(h.handle.snapshot().peers.is_empty());
}

#[tokio::test]
async fn focused_peer_leaving_restores_the_grid() {
    let mut h = room_with(&["p1", "p2", "p3"]).await;

    let _ = h.intent(Intent::FocusPeer("p2".into())).await;
    let view = h.room.snapshot().view;
    assert_eq!((view.cols, view.rows), (1, 1));
    assert_eq!(view.visible_peers, vec!["p2"]);
    assert_eq!(view.focused_peer_id.as_deref(), Some("p2"));

    let _ = h.deliver(peer_left("p2")).await;
    assert_eq!(h.room.focused_peer_id(), None);
    let view = h.handle.snapshot().view;
    assert_eq!((view.cols, view.rows), (2, 1));
    assert_eq!(view.visible_peers, vec!["p1", "p3"]);
    assert_eq!(view.focused_peer_id, None);
}

#[tokio::test]
async fn focus_toggles_and_ignores_unknown_peers() {
    let mut h = room_with(&["p1", "p2"]).await;

    let _ = h.intent(Intent::FocusPeer("p1".into())).await;
    assert_eq!(h.room.focused_peer_id(), Some("p1"));
    let _ = h.intent(Intent::FocusPeer("p1".into())).await;
    assert_eq!(h.room.focused_peer_id(), None);

    let _ = h.intent(Intent::FocusPeer("p2".into())).await;
    let _ = h.intent(Intent::FocusPeer("nobody".into())).await;
    assert_eq!(h.room.focused_peer_id(), Some("p2"));
    let notices = h.notices();
    assert_eq!(notices[0].kind, NoticeKind::UnknownPeer);

    let _ = h.intent(Intent::ClearFocus).await;
    assert_eq!(h.room.snapshot().view.visible_peers, vec!["p1", "p2"]);
}

#[tokio::test]
async fn grid_caps_visible_tiles_and_counts_overflow() {
    let mut h = join().await;
    assert!(h.handle.snapshot().view.solo_local);

    for i in 0..9 {
        let _ = h.deliver(new_peer(&format!("p{i}"))).await;
    }
    let view = h.room.snapshot().view;
    assert_eq!((view.cols, view.rows), (3, 2));
    assert_eq!(view.visible_peers.len(), MAX_VISIBLE_PEERS);
    assert_eq!(view.visible_peers[0], "p0");
    assert_eq!(view.overflow_count, 3);
    assert!(!view.solo_local);
}

#[tokio::test]
async fn malformed_relay_text_is_reported_and_skipped() {
    let mut h = join().await;
    h.relay.deliver_text(r#"{"type":"chat","peerId":"p1"}"#).await.unwrap();
    h.relay.deliver_text("not json").await.unwrap();
    let flow = h.deliver(new_peer("p1")).await;

    assert!(flow.is_continue());
    assert_eq!(h.peer_ids(), vec!["p1"]);
    let kinds: Vec<_> = h.notices().into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::MalformedMessage, NoticeKind::MalformedMessage]);
}

#[tokio::test]
async fn losing_signaling_tears_the_room_down() {
    let mut h = room_with(&["p1"]).await;
    h.relay.hang_up();

    let flow = h.settle().await;
    match flow {
        ControlFlow::Break(Err(err)) => assert!(err.is_room_fatal()),
        other => panic!("expected fatal break, got {other:?}"),
    }
    assert_eq!(h.room.phase(), RoomPhase::Disconnected);
    assert_eq!(h.factory.log("p1").closes(), 1);
    assert!(h
        .notices()
        .iter()
        .any(|n| n.kind == NoticeKind::SignalingLost));
}

#[tokio::test]
async fn sending_on_a_closed_channel_is_reported_not_fatal() {
    let mut h = join().await;
    h.relay.stop_reading();

    let flow = h.deliver(new_peer("p1")).await;
    assert!(flow.is_continue());
    assert_eq!(h.room.phase(), RoomPhase::Joined);
    assert_eq!(
        h.room.registry().get("p1").unwrap().state(),
        NegotiationState::Negotiating
    );
    let notices = h.notices();
    assert!(!notices.is_empty());
    assert!(notices.iter().all(|n| n.kind == NoticeKind::SendFailed));
    assert!(notices.iter().all(|n| n.peer_id.as_deref() == Some("p1")));
}

#[tokio::test]
async fn run_loop_processes_relay_traffic_until_leave() {
    let Harness {
        room,
        handle,
        mut relay,
        factory,
        ..
    } = join().await;
    let task = tokio::spawn(room.run());

    relay.deliver(new_peer("p1")).await.unwrap();
    assert!(matches!(relay.next().await, Some(SignalingMessage::Offer { .. })));

    handle.leave().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(factory.log("p1").closes(), 1);
    assert_eq!(handle.snapshot().phase, RoomPhase::Left);
    assert!(matches!(
        handle.toggle_mic().await,
        Err(ConferenceError::RoomClosed)
    ));
}

#[tokio::test]
async fn run_loop_reports_signaling_loss() {
    let Harness {
        room,
        handle: _handle,
        mut relay,
        ..
    } = join().await;
    let task = tokio::spawn(room.run());
    relay.hang_up();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ConferenceError::SignalingConnection(_)));
}

#[tokio::test]
async fn dropping_every_handle_leaves_the_room() {
    let Harness {
        room,
        handle,
        relay: _relay,
        ..
    } = join().await;
    let mut snapshots = handle.subscribe();
    let task = tokio::spawn(room.run());
    drop(handle);

    task.await.unwrap().unwrap();
    assert_eq!(snapshots.borrow_and_update().phase, RoomPhase::Left);
}
