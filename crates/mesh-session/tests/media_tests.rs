//! In-call media and chat tests.
//!
//! Covers:
//! - Camera/microphone toggles without reacquiring devices
//! - Screen share swapping outgoing video on every link
//! - Display capture ended from outside the session
//! - Chat send and receive

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mesh_session::actors::{CallState, SessionNotice};
use mesh_session::errors::SessionError;
use mesh_session::media::MediaStream;
use mesh_session::signaling::{ClientFrame, NegotiationPayload};
use mesh_test_utils::{wait_until, MockMediaDevices, MockPeerConnection, MockRelay, TestPeer};

fn is_offer(frame: &ClientFrame) -> bool {
    matches!(
        frame,
        ClientFrame::Signal {
            payload: NegotiationPayload::Offer { .. },
            ..
        }
    )
}

fn video_id(stream: &MediaStream) -> String {
    stream.video_track().unwrap().id().to_string()
}

/// Last video track id handed to `connection`, once any replacement happened.
fn last_replacement(connection: &MockPeerConnection) -> Option<Option<String>> {
    connection.video_replacements().last().cloned()
}

// ============================================================================
// Toggles
// ============================================================================

#[tokio::test]
async fn test_toggle_video_keeps_device_stream() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();

    assert!(peer.handle.set_video_enabled(false).await.unwrap());
    let media = peer.handle.snapshot().await.unwrap().local_media;
    assert!(media.has_video);
    assert!(!media.video_enabled);
    assert!(media.audio_enabled);

    assert!(peer.handle.set_video_enabled(true).await.unwrap());
    let media = peer.handle.snapshot().await.unwrap().local_media;
    assert!(media.video_enabled);

    assert_eq!(peer.devices.request_count(), 1);
    let issued = peer.devices.issued_streams();
    let camera = issued.first().unwrap().video_track().unwrap();
    assert!(camera.is_enabled());
    assert!(!camera.is_stopped());

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_toggle_audio() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();

    assert!(peer.handle.set_audio_enabled(false).await.unwrap());
    let media = peer.handle.snapshot().await.unwrap().local_media;
    assert!(!media.audio_enabled);
    assert!(media.video_enabled);

    let issued = peer.devices.issued_streams();
    assert!(!issued.first().unwrap().audio_track().unwrap().is_enabled());
    assert_eq!(peer.devices.request_count(), 1);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_toggle_without_track_reports_false() {
    let peer = TestPeer::new("alice")
        .with_devices(MockMediaDevices::new().failing_for(true, true, "NotFoundError"))
        .spawn();
    peer.join("R1").await.unwrap();

    // Audio-only after relaxation.
    assert!(!peer.handle.set_video_enabled(true).await.unwrap());
    assert!(peer.handle.set_audio_enabled(false).await.unwrap());

    peer.shutdown().await.unwrap();
}

// ============================================================================
// Screen share
// ============================================================================

#[tokio::test]
async fn test_screen_share_replaces_video_on_all_links() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob", "carol"]))
        .spawn();
    peer.join("R1").await.unwrap();
    peer.relay.wait_for_frames(2, is_offer).await.unwrap();

    peer.handle.start_screen_share().await.unwrap();
    assert!(peer.handle.snapshot().await.unwrap().local_media.screen_sharing);
    assert_eq!(peer.devices.display_request_count(), 1);

    let displays = peer.devices.display_streams();
    let screen_id = video_id(displays.first().unwrap());
    for connection in peer.transport.connections() {
        let expected = Some(Some(screen_id.clone()));
        wait_until(|| last_replacement(&connection) == expected)
            .await
            .unwrap();
    }

    // Links started during the share send the screen from the start.
    peer.relay.peer_joined("dave").await.unwrap();
    peer.relay.wait_for_offer_to("dave").await.unwrap();
    let dave = peer.transport.latest("dave").unwrap();
    assert_eq!(
        dave.outgoing().video.as_ref().map(|t| t.id().to_string()),
        Some(screen_id.clone())
    );

    // Stopping restores the camera track.
    assert!(peer.handle.stop_screen_share().await.unwrap());
    let issued = peer.devices.issued_streams();
    let camera_id = video_id(issued.first().unwrap());
    for connection in peer.transport.connections() {
        let expected = Some(Some(camera_id.clone()));
        wait_until(|| last_replacement(&connection) == expected)
            .await
            .unwrap();
    }
    assert!(displays
        .first()
        .unwrap()
        .video_track()
        .unwrap()
        .is_stopped());
    assert!(!peer.handle.snapshot().await.unwrap().local_media.screen_sharing);

    // A second stop is a no-op and raises no notice.
    assert!(!peer.handle.stop_screen_share().await.unwrap());
    assert!(peer.notices.try_recv().is_err());

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_display_ended_externally_restores_camera() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob"]))
        .spawn();
    peer.join("R1").await.unwrap();
    peer.relay.wait_for_offer_to("bob").await.unwrap();
    peer.handle.start_screen_share().await.unwrap();

    peer.devices.end_display_capture();

    peer.wait_for_notice(|n| *n == SessionNotice::ScreenShareEnded)
        .await
        .unwrap();
    let snapshot = peer
        .wait_for_snapshot(|s| !s.local_media.screen_sharing)
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::InCall);

    let issued = peer.devices.issued_streams();
    let camera_id = video_id(issued.first().unwrap());
    let bob = peer.transport.latest("bob").unwrap();
    wait_until(|| last_replacement(&bob) == Some(Some(camera_id.clone())))
        .await
        .unwrap();

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_denied_keeps_camera() {
    let peer = TestPeer::new("alice")
        .with_devices(MockMediaDevices::new().with_display_failure("NotAllowedError"))
        .spawn();
    peer.join("R1").await.unwrap();

    let result = peer.handle.start_screen_share().await;
    assert_eq!(result, Err(SessionError::MediaPermissionDenied));

    let media = peer.handle.snapshot().await.unwrap().local_media;
    assert!(!media.screen_sharing);
    assert!(media.video_enabled);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_requires_call() {
    let peer = TestPeer::new("alice").spawn();
    assert!(matches!(
        peer.handle.start_screen_share().await,
        Err(SessionError::InvalidState(_))
    ));
    assert_eq!(peer.devices.display_request_count(), 0);
    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leave_stops_display_capture() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();
    peer.handle.start_screen_share().await.unwrap();

    peer.handle.leave().await.unwrap();

    assert_eq!(peer.devices.live_track_count(), 0);
    assert!(!peer.handle.snapshot().await.unwrap().local_media.screen_sharing);

    peer.shutdown().await.unwrap();
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_send_chat_appends_and_relays() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();

    let message = peer.handle.send_chat("hello").await.unwrap();
    assert!(message.is_local);
    assert_eq!(message.text, "hello");
    assert_eq!(message.sender_id.as_str(), "alice");

    let frame = peer
        .relay
        .wait_for_frame(|f| matches!(f, ClientFrame::SendMessage { .. }))
        .await
        .unwrap();
    match frame {
        ClientFrame::SendMessage {
            room_id, id, text, ..
        } => {
            assert_eq!(room_id.as_str(), "R1");
            assert_eq!(id, message.id);
            assert_eq!(text, "hello");
        }
        other => panic!("unexpected frame {other:?}"),
    }

    let chat = peer.handle.snapshot().await.unwrap().chat;
    assert_eq!(chat, vec![message]);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blank_chat_is_rejected() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();

    assert_eq!(
        peer.handle.send_chat("   \n\t").await,
        Err(SessionError::EmptyMessage)
    );
    assert_eq!(peer.handle.send_chat("").await, Err(SessionError::EmptyMessage));
    assert!(peer.handle.snapshot().await.unwrap().chat.is_empty());
    assert_eq!(
        peer.relay
            .count_frames(|f| matches!(f, ClientFrame::SendMessage { .. })),
        0
    );

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chat_requires_call() {
    let peer = TestPeer::new("alice").spawn();
    assert!(matches!(
        peer.handle.send_chat("hello").await,
        Err(SessionError::InvalidState(_))
    ));
    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_chat_is_appended_in_order() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();

    peer.relay.chat_from("bob", "first").await.unwrap();
    // Our own broadcast echoed back is not a second entry.
    peer.relay.chat_from("alice", "echo").await.unwrap();
    peer.relay.chat_from("carol", "second").await.unwrap();

    let snapshot = peer
        .wait_for_snapshot(|s| s.chat.len() == 2)
        .await
        .unwrap();
    let texts: Vec<&str> = snapshot.chat.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second"]);
    assert!(snapshot.chat.iter().all(|m| !m.is_local));

    let senders: Vec<&str> = snapshot
        .chat
        .iter()
        .map(|m| m.sender_id.as_str())
        .collect();
    assert_eq!(senders, vec!["bob", "carol"]);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transcript_cleared_on_leave() {
    let peer = TestPeer::new("alice").spawn();
    peer.join("R1").await.unwrap();
    peer.handle.send_chat("bye").await.unwrap();

    peer.handle.leave().await.unwrap();
    assert!(peer.handle.snapshot().await.unwrap().chat.is_empty());

    peer.join("R1").await.unwrap();
    assert!(peer.handle.snapshot().await.unwrap().chat.is_empty());

    peer.shutdown().await.unwrap();
}
