//! Mock media engine.
//!
//! `MockPeerTransport` implements `PeerTransport`. Each `connect()` creates a
//! `MockPeerConnection` that records what the link actor asked of it. By
//! default a connection reports a remote stream as soon as negotiation
//! completes on its side (answer accepted for outbound, offer accepted for
//! inbound).

use async_trait::async_trait;
use mesh_session::actors::LinkDirection;
use mesh_session::errors::LinkError;
use mesh_session::media::{MediaStream, MediaTrack, OutgoingMedia, TrackKind, TrackSource};
use mesh_session::peers::{LinkSetup, PeerConnection, PeerTransport, TransportEvent};
use mesh_session::signaling::IceCandidate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How a mock connection behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Report a remote stream once negotiation completes.
    #[default]
    OnNegotiated,
    /// Negotiate but never report remote media.
    Never,
    /// Refuse to create the connection.
    Refuse,
}

/// Mock `PeerTransport`.
#[derive(Debug, Clone, Default)]
pub struct MockPeerTransport {
    inner: Arc<Mutex<TransportState>>,
}

#[derive(Debug, Default)]
struct TransportState {
    behavior: ConnectBehavior,
    per_peer: HashMap<String, ConnectBehavior>,
    connect_attempts: Vec<String>,
    connections: Vec<Arc<MockPeerConnection>>,
}

impl MockPeerTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviour for every peer without an override.
    #[must_use]
    pub fn with_behavior(self, behavior: ConnectBehavior) -> Self {
        self.lock().behavior = behavior;
        self
    }

    /// Behaviour for connections to `peer`.
    #[must_use]
    pub fn with_peer_behavior(self, peer: &str, behavior: ConnectBehavior) -> Self {
        self.lock().per_peer.insert(peer.to_string(), behavior);
        self
    }

    #[must_use]
    pub fn as_transport(&self) -> Arc<dyn PeerTransport> {
        Arc::new(self.clone())
    }

    /// Every connection created, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.lock().connections.clone()
    }

    /// Connections created for `peer`, in order.
    #[must_use]
    pub fn connections_to(&self, peer: &str) -> Vec<Arc<MockPeerConnection>> {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.peer_id() == peer)
            .cloned()
            .collect()
    }

    /// The most recent connection to `peer`.
    #[must_use]
    pub fn latest(&self, peer: &str) -> Option<Arc<MockPeerConnection>> {
        self.connections_to(peer).pop()
    }

    /// Number of connections created for `peer`.
    #[must_use]
    pub fn connects_to(&self, peer: &str) -> usize {
        self.connections_to(peer).len()
    }

    /// Number of `connect()` calls, refused ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts.len()
    }

    /// Connections that have not been closed.
    #[must_use]
    pub fn open_connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.lock()
            .connections
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// Total `close()` calls across all connections.
    #[must_use]
    pub fn total_closes(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .map(|c| c.close_count())
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn connect(&self, setup: LinkSetup) -> Result<Arc<dyn PeerConnection>, LinkError> {
        let mut state = self.lock();
        let peer = setup.peer_id.as_str().to_string();
        state.connect_attempts.push(peer.clone());
        let behavior = state
            .per_peer
            .get(&peer)
            .copied()
            .unwrap_or(state.behavior);
        if behavior == ConnectBehavior::Refuse {
            return Err(LinkError::Transport("mock transport refused".to_string()));
        }

        let connection = Arc::new(MockPeerConnection {
            peer_id: peer,
            direction: setup.direction,
            outgoing: setup.outgoing,
            ice_servers: setup.ice_servers,
            behavior,
            events: setup.events,
            state: Mutex::new(ConnectionState::default()),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// One mock peer connection.
#[derive(Debug)]
pub struct MockPeerConnection {
    peer_id: String,
    direction: LinkDirection,
    outgoing: OutgoingMedia,
    ice_servers: Vec<String>,
    behavior: ConnectBehavior,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<ConnectionState>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    offers_created: usize,
    remote_offer: Option<String>,
    remote_answers: Vec<String>,
    candidates: Vec<IceCandidate>,
    /// Track ids passed to `replace_video_track`; `None` means no video.
    video_replacements: Vec<Option<String>>,
    close_count: usize,
}

impl MockPeerConnection {
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[must_use]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// Media the link was created with.
    #[must_use]
    pub fn outgoing(&self) -> &OutgoingMedia {
        &self.outgoing
    }

    #[must_use]
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.lock().offers_created
    }

    #[must_use]
    pub fn remote_offer(&self) -> Option<String> {
        self.lock().remote_offer.clone()
    }

    #[must_use]
    pub fn remote_answers(&self) -> Vec<String> {
        self.lock().remote_answers.clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.lock().candidates.clone()
    }

    #[must_use]
    pub fn video_replacements(&self) -> Vec<Option<String>> {
        self.lock().video_replacements.clone()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Report remote media now.
    pub async fn deliver_remote_stream(&self) {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Remote),
            MediaTrack::new(TrackKind::Video, TrackSource::Remote),
        ]);
        let _ = self.events.send(TransportEvent::RemoteStream(stream)).await;
    }

    /// Report a local ICE candidate.
    pub async fn emit_local_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(IceCandidate {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }))
            .await;
    }

    /// Report a transport failure (ICE or DTLS).
    pub async fn fail(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Failed(reason.to_string()))
            .await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<String, LinkError> {
        self.lock().offers_created += 1;
        Ok(format!("v=0 offer-to {}", self.peer_id))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, LinkError> {
        self.lock().remote_offer = Some(sdp);
        if self.behavior == ConnectBehavior::OnNegotiated {
            self.deliver_remote_stream().await;
        }
        Ok(format!("v=0 answer-to {}", self.peer_id))
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), LinkError> {
        self.lock().remote_answers.push(sdp);
        if self.behavior == ConnectBehavior::OnNegotiated {
            self.deliver_remote_stream().await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.lock().candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), LinkError> {
        self.lock()
            .video_replacements
            .push(track.map(|t| t.id().to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.lock().close_count += 1;
    }
}
