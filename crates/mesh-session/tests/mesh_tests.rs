//! Peer mesh tests: one link per remote peer.
//!
//! Covers:
//! - Roster snapshots and join/leave deltas keeping the link set in sync
//! - Offer collisions resolved by id order
//! - Link failures and negotiation timeouts staying local to one peer
//! - Teardown closing every link once and releasing media once

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use mesh_session::actors::{CallState, ConnectionState, LinkDirection, SessionNotice};
use mesh_session::signaling::{ClientFrame, NegotiationId, NegotiationPayload};
use mesh_test_utils::{wait_until, ConnectBehavior, MockPeerTransport, MockRelay, TestPeer};

fn remote_ids(snapshot: &mesh_session::actors::CallSnapshot) -> BTreeSet<String> {
    snapshot
        .remote_participants()
        .map(|p| p.peer_id.as_str().to_string())
        .collect()
}

fn ids(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

fn is_offer(frame: &ClientFrame) -> bool {
    matches!(
        frame,
        ClientFrame::Signal {
            payload: NegotiationPayload::Offer { .. },
            ..
        }
    )
}

// ============================================================================
// Roster reconciliation
// ============================================================================

#[tokio::test]
async fn test_link_set_follows_roster_and_deltas() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob", "carol"]))
        .spawn();
    peer.join("R1").await.unwrap();
    peer.relay.wait_for_frames(2, is_offer).await.unwrap();

    // A fresh snapshot drops bob and adds dave.
    peer.relay.roster(&["alice", "carol", "dave"]).await.unwrap();
    let snapshot = peer
        .wait_for_snapshot(|s| remote_ids(s) == ids(&["carol", "dave"]))
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::InCall);
    peer.wait_for_notice(|n| *n == SessionNotice::PeerLeft("bob".into()))
        .await
        .unwrap();

    // Deltas after the snapshot.
    peer.relay.peer_joined("erin").await.unwrap();
    peer.relay.peer_left("carol").await.unwrap();
    // Duplicate join for an existing peer must not add a second link.
    peer.relay.peer_joined("dave").await.unwrap();
    // Leave for an unknown peer is a no-op.
    peer.relay.peer_left("zed").await.unwrap();

    peer.wait_for_snapshot(|s| remote_ids(s) == ids(&["dave", "erin"]))
        .await
        .unwrap();
    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(remote_ids(&snapshot), ids(&["dave", "erin"]));

    assert_eq!(peer.transport.connects_to("dave"), 1);
    assert_eq!(peer.transport.connects_to("erin"), 1);
    assert_eq!(peer.handle.metrics().links_active, 2);

    let transport = peer.transport.clone();
    wait_until(|| {
        let open: BTreeSet<String> = transport
            .open_connections()
            .iter()
            .map(|c| c.peer_id().to_string())
            .collect();
        open == ids(&["dave", "erin"])
    })
    .await
    .unwrap();

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_roster_ignores_local_id_and_deltas_before_join() {
    let peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["alice"]))
        .spawn();
    let joined = peer.join("R1").await.unwrap();
    assert_eq!(joined.roster_size, 0);

    peer.relay.peer_joined("alice").await.unwrap();
    peer.relay.peer_joined("bob").await.unwrap();
    let snapshot = peer
        .wait_for_snapshot(|s| s.remote_participants().count() == 1)
        .await
        .unwrap();
    assert_eq!(remote_ids(&snapshot), ids(&["bob"]));
    assert_eq!(peer.transport.connects_to("alice"), 0);

    peer.shutdown().await.unwrap();
}

// ============================================================================
// Offer collisions
// ============================================================================

/// "alice" sorts lower, so her outbound link survives her own collision.
#[tokio::test]
async fn test_lower_id_keeps_outbound_link_on_collision() {
    let peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob"]))
        .spawn();
    peer.join("R1").await.unwrap();
    let (ours, _) = peer.relay.wait_for_offer_to("bob").await.unwrap();

    // Bob called us at the same time.
    let theirs = NegotiationId::new();
    peer.relay
        .signal_from(
            "bob",
            theirs,
            NegotiationPayload::Offer {
                sdp: "v=0 offer from bob".to_string(),
            },
        )
        .await
        .unwrap();
    // Bob then answers our offer, having lost the collision.
    peer.relay
        .signal_from(
            "bob",
            ours,
            NegotiationPayload::Answer {
                sdp: "v=0 answer from bob".to_string(),
            },
        )
        .await
        .unwrap();

    let snapshot = peer.wait_for_connected(1).await.unwrap();
    let bob = snapshot.participant(&"bob".into()).unwrap();
    assert_eq!(bob.direction, Some(LinkDirection::Outbound));

    assert_eq!(peer.transport.connects_to("bob"), 1);
    let link = peer.transport.latest("bob").unwrap();
    assert_eq!(link.direction(), LinkDirection::Outbound);
    assert!(!link.is_closed());
    assert!(link.remote_offer().is_none());

    let answered = peer
        .relay
        .signals_to("bob")
        .iter()
        .any(|(_, p)| matches!(p, NegotiationPayload::Answer { .. }));
    assert!(!answered);
    assert_eq!(peer.handle.metrics().links_active, 1);

    peer.shutdown().await.unwrap();
}

/// "bob" sorts higher, so he discards his outbound attempt and answers.
#[tokio::test]
async fn test_higher_id_yields_to_inbound_offer_on_collision() {
    let peer = TestPeer::new("bob")
        .with_relay(MockRelay::new().with_roster(&["alice"]))
        .spawn();
    peer.join("R1").await.unwrap();
    let (discarded, _) = peer.relay.wait_for_offer_to("alice").await.unwrap();

    let initiator = NegotiationId::new();
    peer.relay
        .signal_from(
            "alice",
            initiator,
            NegotiationPayload::Offer {
                sdp: "v=0 offer from alice".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        peer.relay.wait_for_answer_to("alice").await.unwrap(),
        initiator
    );
    let snapshot = peer.wait_for_connected(1).await.unwrap();
    let alice = snapshot.participant(&"alice".into()).unwrap();
    assert_eq!(alice.direction, Some(LinkDirection::Inbound));

    let links = peer.transport.connections_to("alice");
    assert_eq!(links.len(), 2);
    let first = links.first().unwrap().clone();
    let second = links.get(1).unwrap().clone();
    assert_eq!(first.direction(), LinkDirection::Outbound);
    assert_eq!(second.direction(), LinkDirection::Inbound);
    assert_eq!(second.remote_offer().as_deref(), Some("v=0 offer from alice"));
    let discarded_link = first.clone();
    wait_until(|| discarded_link.is_closed()).await.unwrap();
    assert!(!second.is_closed());

    // A late answer to the discarded offer goes nowhere.
    peer.relay
        .signal_from(
            "alice",
            discarded,
            NegotiationPayload::Answer {
                sdp: "v=0 late answer".to_string(),
            },
        )
        .await
        .unwrap();
    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.remote_participants().count(), 1);
    assert!(first.remote_answers().is_empty());
    assert_eq!(peer.handle.metrics().links_active, 1);

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collision_outcome_is_reproducible() {
    for _ in 0..3 {
        let peer = TestPeer::new("bob")
            .with_relay(MockRelay::new().with_roster(&["alice"]))
            .spawn();
        peer.join("R1").await.unwrap();
        peer.relay.wait_for_offer_to("alice").await.unwrap();

        peer.relay
            .signal_from(
                "alice",
                NegotiationId::new(),
                NegotiationPayload::Offer {
                    sdp: "v=0".to_string(),
                },
            )
            .await
            .unwrap();

        let snapshot = peer.wait_for_connected(1).await.unwrap();
        let alice = snapshot.participant(&"alice".into()).unwrap();
        assert_eq!(alice.direction, Some(LinkDirection::Inbound));
        peer.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_remote_candidates_reach_current_link_only() {
    let peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob"]))
        .spawn();
    peer.join("R1").await.unwrap();
    let (current, _) = peer.relay.wait_for_offer_to("bob").await.unwrap();

    let candidate = |c: &str| {
        NegotiationPayload::Candidate(mesh_session::signaling::IceCandidate {
            candidate: c.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        })
    };
    peer.relay
        .signal_from("bob", NegotiationId::new(), candidate("stale"))
        .await
        .unwrap();
    peer.relay
        .signal_from("bob", current, candidate("fresh"))
        .await
        .unwrap();

    let link = peer.transport.latest("bob").unwrap();
    wait_until(|| !link.candidates().is_empty()).await.unwrap();
    let received: Vec<String> = link.candidates().into_iter().map(|c| c.candidate).collect();
    assert_eq!(received, vec!["fresh".to_string()]);

    // Local candidates are relayed with the link's negotiation id.
    link.emit_local_candidate("local-1").await;
    let frame = peer
        .relay
        .wait_for_frame(|f| {
            matches!(
                f,
                ClientFrame::Signal {
                    payload: NegotiationPayload::Candidate(_),
                    ..
                }
            )
        })
        .await
        .unwrap();
    assert!(matches!(
        frame,
        ClientFrame::Signal { negotiation_id, .. } if negotiation_id == current
    ));

    peer.shutdown().await.unwrap();
}

// ============================================================================
// Link failures
// ============================================================================

#[tokio::test]
async fn test_refused_link_is_removed_and_call_continues() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob", "carol"]))
        .with_transport(MockPeerTransport::new().with_peer_behavior("bob", ConnectBehavior::Refuse))
        .spawn();
    peer.join("R1").await.unwrap();

    let notice = peer
        .wait_for_notice(|n| matches!(n, SessionNotice::PeerLinkFailed { .. }))
        .await
        .unwrap();
    assert!(matches!(
        notice,
        SessionNotice::PeerLinkFailed { peer_id, .. } if peer_id.as_str() == "bob"
    ));

    let snapshot = peer
        .wait_for_snapshot(|s| remote_ids(s) == ids(&["carol"]))
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::InCall);
    assert_eq!(peer.handle.metrics().link_failures, 1);

    peer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_link_that_never_connects_times_out() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob"]))
        .with_transport(MockPeerTransport::new().with_behavior(ConnectBehavior::Never))
        .with_config(|c| c.negotiation_timeout_seconds = 2)
        .spawn();
    peer.join("R1").await.unwrap();
    let (negotiation_id, _) = peer.relay.wait_for_offer_to("bob").await.unwrap();

    // Bob answers but media never flows.
    peer.relay
        .signal_from(
            "bob",
            negotiation_id,
            NegotiationPayload::Answer {
                sdp: "v=0".to_string(),
            },
        )
        .await
        .unwrap();

    peer.wait_for_notice(|n| matches!(n, SessionNotice::PeerLinkFailed { .. }))
        .await
        .unwrap();
    let snapshot = peer
        .wait_for_snapshot(|s| s.remote_participants().count() == 0)
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::InCall);

    let link = peer.transport.latest("bob").unwrap();
    wait_until(|| link.is_closed()).await.unwrap();

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transport_failure_after_connect_removes_peer() {
    let mut peer = TestPeer::new("bob").spawn();
    peer.join("R1").await.unwrap();

    // Alice joins after us and calls in.
    peer.relay.peer_joined("alice").await.unwrap();
    let (outbound, _) = peer.relay.wait_for_offer_to("alice").await.unwrap();
    peer.relay
        .signal_from(
            "alice",
            outbound,
            NegotiationPayload::Answer {
                sdp: "v=0".to_string(),
            },
        )
        .await
        .unwrap();
    peer.wait_for_connected(1).await.unwrap();

    peer.transport
        .latest("alice")
        .unwrap()
        .fail("ice failed")
        .await;

    peer.wait_for_notice(|n| matches!(n, SessionNotice::PeerLinkFailed { .. }))
        .await
        .unwrap();
    let snapshot = peer
        .wait_for_snapshot(|s| s.remote_participants().count() == 0)
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::InCall);

    peer.shutdown().await.unwrap();
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_leave_closes_each_link_once_and_releases_once() {
    let mut peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob", "carol", "dave"]))
        .spawn();
    peer.join("R1").await.unwrap();
    peer.relay.wait_for_frames(3, is_offer).await.unwrap();

    peer.handle.leave().await.unwrap();

    let links = peer.transport.connections();
    assert_eq!(links.len(), 3);
    for link in &links {
        assert_eq!(link.close_count(), 1, "link to {}", link.peer_id());
    }
    assert_eq!(peer.transport.total_closes(), 3);

    let metrics = peer.handle.metrics();
    assert_eq!(metrics.media_releases, 1);
    assert_eq!(metrics.links_created, 3);
    assert_eq!(metrics.links_closed, 3);
    assert_eq!(metrics.links_active, 0);
    assert_eq!(peer.devices.live_track_count(), 0);

    let snapshot = peer.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::Idle);
    assert_eq!(snapshot.participants.len(), 1);
    assert!(snapshot.chat.is_empty());

    peer.relay
        .wait_for_frame(|f| matches!(f, ClientFrame::LeaveRoom { .. }))
        .await
        .unwrap();
    peer.wait_for_notice(|n| *n == SessionNotice::CallEnded { cause: None })
        .await
        .unwrap();

    peer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dispose_ends_call_and_stops_actor() {
    let peer = TestPeer::new("alice")
        .with_relay(MockRelay::new().with_roster(&["bob"]))
        .spawn();
    peer.join("R1").await.unwrap();
    peer.relay.wait_for_offer_to("bob").await.unwrap();

    let relay = peer.relay.clone();
    let transport = peer.transport.clone();
    let devices = peer.devices.clone();
    let handle = peer.handle.clone();
    peer.shutdown().await.unwrap();

    assert_eq!(transport.total_closes(), 1);
    assert_eq!(devices.live_track_count(), 0);
    assert_eq!(
        relay.count_frames(|f| matches!(f, ClientFrame::LeaveRoom { .. })),
        1
    );
    wait_until(|| !relay.is_connected()).await.unwrap();

    // The actor is gone; intents fail with an internal error.
    assert!(handle.snapshot().await.is_err());
    assert_eq!(handle.current().state, CallState::Idle);
    assert_eq!(
        handle
            .current()
            .participants
            .first()
            .map(|p| p.connection_state),
        Some(ConnectionState::AwaitingConnection)
    );
}
