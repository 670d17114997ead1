//! Peer connection mesh.
//!
//! `PeerConnectionManager` owns one entry per known remote peer, keyed by
//! `PeerId`. An entry either waits for local media (optionally holding a
//! queued inbound offer) or owns a running `LinkActor`. Entries are only
//! inserted and removed through `ensure_link`, `accept_inbound`,
//! `close_link`, `reconcile` and `close_all`, so one link per peer holds by
//! construction.
//!
//! # Offer collisions
//!
//! When both sides of a pair start a link at once, the peer whose id sorts
//! lower is the initiator. The higher peer drops its own outbound attempt and
//! answers the lower peer's offer; the lower peer ignores the higher peer's
//! offer. Both sides reach the same decision without coordination.
//!
//! Signals carry the `NegotiationId` of the attempt they belong to. Answers
//! and candidates for any other attempt are dropped.

use crate::actors::link::{LinkActor, LinkActorHandle, LinkParams};
use crate::actors::messages::{
    ConnectionState, DisplayRole, LinkDirection, LinkEvent, ParticipantSession,
};
use crate::actors::metrics::SessionMetrics;
use crate::errors::LinkError;
use crate::media::{MediaStream, MediaTrack, OutgoingMedia};
use crate::observability;
use crate::signaling::protocol::{IceCandidate, NegotiationId};

use async_trait::async_trait;
use common::types::PeerId;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for each link task to exit during `close_all`.
const LINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Events a `PeerConnection` reports while it is open.
#[derive(Debug)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteStream(MediaStream),
    /// The connection failed (ICE or DTLS).
    Failed(String),
    /// The remote side closed the connection.
    Closed,
}

/// Everything a transport needs to open a connection to one peer.
#[derive(Debug)]
pub struct LinkSetup {
    pub peer_id: PeerId,
    pub direction: LinkDirection,
    /// One audio track and one video track (camera or screen).
    pub outgoing: OutgoingMedia,
    /// STUN server URLs. No TURN fallback.
    pub ice_servers: Vec<String>,
    /// Where the connection reports `TransportEvent`s.
    pub events: mpsc::Sender<TransportEvent>,
}

/// One negotiated media connection to a remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the local offer SDP.
    async fn create_offer(&self) -> Result<String, LinkError>;

    /// Apply a remote offer and return the local answer SDP.
    async fn accept_offer(&self, sdp: String) -> Result<String, LinkError>;

    /// Apply the remote answer to our offer.
    async fn accept_answer(&self, sdp: String) -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Swap the outgoing video source without renegotiating.
    async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), LinkError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn connect(&self, setup: LinkSetup) -> Result<Arc<dyn PeerConnection>, LinkError>;
}

/// Result of `ensure_link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// An outbound link was started.
    Created,
    /// Local media is not ready; the link starts once it is.
    Queued,
    /// The peer already has an entry.
    AlreadyPresent,
    /// The id is our own.
    IgnoredSelf,
}

/// Result of `accept_inbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// An inbound link was started.
    Accepted,
    /// An existing link was discarded in favour of this offer.
    Replaced,
    /// The offer lost the collision, repeats the current attempt, or is ours.
    Ignored,
    /// Local media is not ready; the latest offer is kept until it is.
    Queued,
}

/// A peer removed by `close_link`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedPeer {
    pub peer_id: PeerId,
    /// Whether a link actor was running for the peer.
    pub had_link: bool,
    pub was_connected: bool,
}

/// Changes made by `reconcile`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

struct QueuedOffer {
    negotiation_id: NegotiationId,
    sdp: String,
    candidates: Vec<IceCandidate>,
}

struct PeerLink {
    handle: LinkActorHandle,
    task: JoinHandle<()>,
    state: ConnectionState,
    remote_stream: Option<MediaStream>,
    started_at: Instant,
}

enum PeerSlot {
    /// Waiting for local media.
    Awaiting { offer: Option<QueuedOffer> },
    Linked(PeerLink),
}

struct PeerEntry {
    arrival: u64,
    role: DisplayRole,
    slot: PeerSlot,
}

/// Owner of the peer mesh for one session.
pub struct PeerConnectionManager {
    local_id: PeerId,
    transport: Arc<dyn PeerTransport>,
    ice_servers: Vec<String>,
    negotiation_timeout: Duration,
    link_events: mpsc::Sender<LinkEvent>,
    /// Parent token; each link runs under a child of it.
    cancel_token: CancellationToken,
    metrics: Arc<SessionMetrics>,
    /// `None` until local media is ready.
    outgoing: Option<OutgoingMedia>,
    peers: BTreeMap<PeerId, PeerEntry>,
    next_arrival: u64,
}

impl PeerConnectionManager {
    #[must_use]
    pub fn new(
        local_id: PeerId,
        transport: Arc<dyn PeerTransport>,
        ice_servers: Vec<String>,
        negotiation_timeout: Duration,
        link_events: mpsc::Sender<LinkEvent>,
        cancel_token: CancellationToken,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            local_id,
            transport,
            ice_servers,
            negotiation_timeout,
            link_events,
            cancel_token,
            metrics,
            outgoing: None,
            peers: BTreeMap::new(),
            next_arrival: 0,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Provide local media and start every link that was waiting for it.
    ///
    /// Returns the number of links started.
    pub fn set_outgoing_media(&mut self, media: OutgoingMedia) -> usize {
        self.outgoing = Some(media);

        let waiting: Vec<(PeerId, Option<QueuedOffer>)> = self
            .peers
            .iter_mut()
            .filter_map(|(peer_id, entry)| match &mut entry.slot {
                PeerSlot::Awaiting { offer } => Some((peer_id.clone(), offer.take())),
                PeerSlot::Linked(_) => None,
            })
            .collect();

        let mut started = 0;
        for (peer_id, offer) in waiting {
            let link = match offer {
                Some(offer) => self.spawn_link(
                    &peer_id,
                    LinkDirection::Inbound,
                    offer.negotiation_id,
                    Some(offer),
                ),
                None => self.spawn_link(
                    &peer_id,
                    LinkDirection::Outbound,
                    NegotiationId::new(),
                    None,
                ),
            };
            if let (Some(link), Some(entry)) = (link, self.peers.get_mut(&peer_id)) {
                entry.slot = PeerSlot::Linked(link);
                started += 1;
            }
        }

        if started > 0 {
            debug!(
                target: "mesh.session.peers",
                started = started,
                "Queued links started"
            );
        }
        started
    }

    /// Guarantee exactly one link (or queued link intent) for `peer_id`.
    pub fn ensure_link(&mut self, peer_id: &PeerId) -> EnsureOutcome {
        if peer_id == &self.local_id {
            return EnsureOutcome::IgnoredSelf;
        }
        if self.peers.contains_key(peer_id) {
            return EnsureOutcome::AlreadyPresent;
        }

        let (slot, outcome) = match self.spawn_link(
            peer_id,
            LinkDirection::Outbound,
            NegotiationId::new(),
            None,
        ) {
            Some(link) => (PeerSlot::Linked(link), EnsureOutcome::Created),
            None => (PeerSlot::Awaiting { offer: None }, EnsureOutcome::Queued),
        };
        self.insert_entry(peer_id.clone(), slot);

        debug!(
            target: "mesh.session.peers",
            peer_id = %peer_id,
            outcome = ?outcome,
            "Link ensured"
        );
        outcome
    }

    /// Handle an offer from `peer_id`, resolving collisions by id order.
    pub fn accept_inbound(
        &mut self,
        peer_id: &PeerId,
        negotiation_id: NegotiationId,
        sdp: String,
    ) -> InboundOutcome {
        if peer_id == &self.local_id {
            return InboundOutcome::Ignored;
        }

        let offer = QueuedOffer {
            negotiation_id,
            sdp,
            candidates: Vec::new(),
        };

        if !self.peers.contains_key(peer_id) {
            let (slot, outcome) = self.inbound_slot(peer_id, offer);
            self.insert_entry(peer_id.clone(), slot);
            return outcome;
        }

        let replace = match self.peers.get_mut(peer_id).map(|entry| &mut entry.slot) {
            None => return InboundOutcome::Ignored,
            Some(PeerSlot::Awaiting { offer: queued }) => {
                // Latest offer per peer wins.
                *queued = Some(offer);
                debug!(
                    target: "mesh.session.peers",
                    peer_id = %peer_id,
                    negotiation_id = %negotiation_id,
                    "Inbound offer queued until local media is ready"
                );
                return InboundOutcome::Queued;
            }
            Some(PeerSlot::Linked(link)) => {
                if link.handle.negotiation_id() == negotiation_id {
                    debug!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        "Repeated offer for current attempt ignored"
                    );
                    return InboundOutcome::Ignored;
                }
                if link.handle.direction() == LinkDirection::Outbound && self.local_id < *peer_id {
                    info!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        "Offer collision: local peer is initiator, keeping outbound link"
                    );
                    return InboundOutcome::Ignored;
                }
                offer
            }
        };

        // Either we lost the collision or the remote restarted its attempt.
        let Some(entry) = self.peers.remove(peer_id) else {
            return InboundOutcome::Ignored;
        };
        if let PeerSlot::Linked(previous) = entry.slot {
            info!(
                target: "mesh.session.peers",
                peer_id = %peer_id,
                discarded = %previous.handle.negotiation_id(),
                accepted = %replace.negotiation_id,
                direction = previous.handle.direction().as_str(),
                "Discarding link in favour of inbound offer"
            );
            previous.handle.cancel();
            self.metrics.link_closed();
        }
        let (slot, outcome) = self.inbound_slot(peer_id, replace);
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                arrival: entry.arrival,
                role: entry.role,
                slot,
            },
        );
        match outcome {
            InboundOutcome::Accepted => InboundOutcome::Replaced,
            other => other,
        }
    }

    fn inbound_slot(&self, peer_id: &PeerId, offer: QueuedOffer) -> (PeerSlot, InboundOutcome) {
        if self.outgoing.is_none() {
            return (
                PeerSlot::Awaiting { offer: Some(offer) },
                InboundOutcome::Queued,
            );
        }
        match self.spawn_link(
            peer_id,
            LinkDirection::Inbound,
            offer.negotiation_id,
            Some(offer),
        ) {
            Some(link) => (PeerSlot::Linked(link), InboundOutcome::Accepted),
            None => (PeerSlot::Awaiting { offer: None }, InboundOutcome::Queued),
        }
    }

    /// Route the remote answer to the outbound attempt it belongs to.
    ///
    /// Returns false if the answer was stale and dropped.
    pub async fn route_answer(
        &self,
        peer_id: &PeerId,
        negotiation_id: NegotiationId,
        sdp: String,
    ) -> bool {
        match self.current_link(peer_id, negotiation_id) {
            Some(link) if link.handle.direction() == LinkDirection::Outbound => {
                link.handle.remote_answer(sdp).await.is_ok()
            }
            _ => {
                debug!(
                    target: "mesh.session.peers",
                    peer_id = %peer_id,
                    negotiation_id = %negotiation_id,
                    "Stale answer dropped"
                );
                false
            }
        }
    }

    /// Route a remote ICE candidate to the attempt it belongs to.
    ///
    /// Candidates for a queued offer are held with it. Returns false if the
    /// candidate was stale and dropped.
    pub async fn route_candidate(
        &mut self,
        peer_id: &PeerId,
        negotiation_id: NegotiationId,
        candidate: IceCandidate,
    ) -> bool {
        match self.peers.get_mut(peer_id).map(|entry| &mut entry.slot) {
            Some(PeerSlot::Linked(link)) if link.handle.negotiation_id() == negotiation_id => {
                return link.handle.remote_candidate(candidate).await.is_ok();
            }
            Some(PeerSlot::Awaiting {
                offer: Some(queued),
            }) if queued.negotiation_id == negotiation_id => {
                queued.candidates.push(candidate);
                return true;
            }
            _ => {}
        }
        debug!(
            target: "mesh.session.peers",
            peer_id = %peer_id,
            negotiation_id = %negotiation_id,
            "Stale candidate dropped"
        );
        false
    }

    /// Whether `negotiation_id` is the live attempt for `peer_id`.
    #[must_use]
    pub fn is_current(&self, peer_id: &PeerId, negotiation_id: NegotiationId) -> bool {
        self.current_link(peer_id, negotiation_id).is_some()
    }

    fn current_link(&self, peer_id: &PeerId, negotiation_id: NegotiationId) -> Option<&PeerLink> {
        match self.peers.get(peer_id).map(|entry| &entry.slot) {
            Some(PeerSlot::Linked(link)) if link.handle.negotiation_id() == negotiation_id => {
                Some(link)
            }
            _ => None,
        }
    }

    /// Attach remote media and mark the link connected.
    ///
    /// Returns false if the event came from a discarded attempt.
    pub fn on_remote_stream(
        &mut self,
        peer_id: &PeerId,
        negotiation_id: NegotiationId,
        stream: MediaStream,
    ) -> bool {
        let Some(PeerSlot::Linked(link)) = self.peers.get_mut(peer_id).map(|e| &mut e.slot) else {
            return false;
        };
        if link.handle.negotiation_id() != negotiation_id {
            return false;
        }
        if link.state != ConnectionState::Connected {
            observability::record_link_negotiation(link.started_at.elapsed());
        }
        link.state = ConnectionState::Connected;
        link.remote_stream = Some(stream);
        true
    }

    /// Remove the peer whose current link failed.
    ///
    /// Returns false if the failure came from a discarded attempt.
    pub fn on_link_failed(
        &mut self,
        peer_id: &PeerId,
        negotiation_id: NegotiationId,
        error: &LinkError,
    ) -> bool {
        if !self.is_current(peer_id, negotiation_id) {
            debug!(
                target: "mesh.session.peers",
                peer_id = %peer_id,
                negotiation_id = %negotiation_id,
                "Failure from discarded attempt ignored"
            );
            return false;
        }
        self.metrics.record_link_failure(error.as_label());
        self.close_link(peer_id).is_some()
    }

    /// Tear down the link for `peer_id` and forget the peer. Idempotent.
    pub fn close_link(&mut self, peer_id: &PeerId) -> Option<ClosedPeer> {
        let entry = self.peers.remove(peer_id)?;
        let closed = match entry.slot {
            PeerSlot::Linked(link) => {
                link.handle.cancel();
                self.metrics.link_closed();
                ClosedPeer {
                    peer_id: peer_id.clone(),
                    had_link: true,
                    was_connected: link.state == ConnectionState::Connected,
                }
            }
            PeerSlot::Awaiting { .. } => ClosedPeer {
                peer_id: peer_id.clone(),
                had_link: false,
                was_connected: false,
            },
        };
        debug!(
            target: "mesh.session.peers",
            peer_id = %peer_id,
            had_link = closed.had_link,
            "Peer closed"
        );
        Some(closed)
    }

    /// Close every link, drop queued intents and forget local media.
    ///
    /// Waits for each link task to exit. Returns the number of links closed.
    pub async fn close_all(&mut self) -> usize {
        let entries = std::mem::take(&mut self.peers);
        self.outgoing = None;
        self.next_arrival = 0;

        let mut tasks = Vec::new();
        for (peer_id, entry) in entries {
            if let PeerSlot::Linked(link) = entry.slot {
                link.handle.cancel();
                self.metrics.link_closed();
                tasks.push((peer_id, link.task));
            }
        }

        let closed = tasks.len();
        for (peer_id, task) in tasks {
            match tokio::time::timeout(LINK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        "Link task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        error = ?e,
                        "Link task panicked"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        "Link task did not exit within timeout"
                    );
                }
            }
        }

        if closed > 0 {
            info!(
                target: "mesh.session.peers",
                links_closed = closed,
                "All peer links closed"
            );
        }
        closed
    }

    /// Make the peer set match `roster`: close peers absent from it and
    /// ensure links for the rest.
    pub fn reconcile(&mut self, roster: &[PeerId]) -> ReconcileSummary {
        let wanted: HashSet<&PeerId> = roster.iter().filter(|p| **p != self.local_id).collect();

        let stale: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|peer_id| !wanted.contains(peer_id))
            .cloned()
            .collect();
        let mut summary = ReconcileSummary::default();
        for peer_id in stale {
            if self.close_link(&peer_id).is_some() {
                summary.removed.push(peer_id);
            }
        }

        for peer_id in roster {
            match self.ensure_link(peer_id) {
                EnsureOutcome::Created | EnsureOutcome::Queued => {
                    summary.added.push(peer_id.clone());
                }
                EnsureOutcome::AlreadyPresent | EnsureOutcome::IgnoredSelf => {}
            }
        }

        debug!(
            target: "mesh.session.peers",
            roster_size = roster.len(),
            added = summary.added.len(),
            removed = summary.removed.len(),
            "Roster reconciled"
        );
        summary
    }

    /// Send `track` as the outgoing video on every link and on links
    /// started later. Returns the number of running links updated.
    pub async fn replace_outgoing_video(&mut self, track: Option<MediaTrack>) -> usize {
        if let Some(outgoing) = self.outgoing.as_mut() {
            outgoing.video.clone_from(&track);
        }

        let mut updated = 0;
        for (peer_id, entry) in &self.peers {
            let PeerSlot::Linked(link) = &entry.slot else {
                continue;
            };
            match link.handle.replace_video(track.clone()).await {
                Ok(()) => updated += 1,
                Err(e) => {
                    debug!(
                        target: "mesh.session.peers",
                        peer_id = %peer_id,
                        error = %e,
                        "Link gone before video replacement"
                    );
                }
            }
        }
        updated
    }

    /// Remote participants ordered by arrival.
    #[must_use]
    pub fn sessions(&self) -> Vec<ParticipantSession> {
        let mut entries: Vec<(&PeerId, &PeerEntry)> = self.peers.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.arrival);
        entries
            .into_iter()
            .map(|(peer_id, entry)| {
                let (connection_state, direction, stream) = match &entry.slot {
                    PeerSlot::Awaiting { .. } => (ConnectionState::AwaitingConnection, None, None),
                    PeerSlot::Linked(link) => (
                        link.state,
                        Some(link.handle.direction()),
                        link.remote_stream.clone(),
                    ),
                };
                ParticipantSession {
                    peer_id: peer_id.clone(),
                    display_role: entry.role,
                    connection_state,
                    direction,
                    stream,
                    is_local: false,
                }
            })
            .collect()
    }

    /// Number of running link actors.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| matches!(entry.slot, PeerSlot::Linked(_)))
            .count()
    }

    /// Number of known peers, linked or waiting.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn link_direction(&self, peer_id: &PeerId) -> Option<LinkDirection> {
        match &self.peers.get(peer_id)?.slot {
            PeerSlot::Linked(link) => Some(link.handle.direction()),
            PeerSlot::Awaiting { .. } => None,
        }
    }

    #[must_use]
    pub fn negotiation_id(&self, peer_id: &PeerId) -> Option<NegotiationId> {
        match &self.peers.get(peer_id)?.slot {
            PeerSlot::Linked(link) => Some(link.handle.negotiation_id()),
            PeerSlot::Awaiting { offer } => offer.as_ref().map(|o| o.negotiation_id),
        }
    }

    #[must_use]
    pub fn connection_state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        match &self.peers.get(peer_id)?.slot {
            PeerSlot::Linked(link) => Some(link.state),
            PeerSlot::Awaiting { .. } => Some(ConnectionState::AwaitingConnection),
        }
    }

    fn insert_entry(&mut self, peer_id: PeerId, slot: PeerSlot) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.peers.insert(
            peer_id,
            PeerEntry {
                arrival,
                role: DisplayRole::for_arrival(arrival),
                slot,
            },
        );
    }

    /// Spawn a link actor, or `None` while local media is missing.
    fn spawn_link(
        &self,
        peer_id: &PeerId,
        direction: LinkDirection,
        negotiation_id: NegotiationId,
        offer: Option<QueuedOffer>,
    ) -> Option<PeerLink> {
        let outgoing = self.outgoing.clone()?;
        let (remote_offer, remote_candidates) = match offer {
            Some(offer) => (Some(offer.sdp), offer.candidates),
            None => (None, Vec::new()),
        };

        let params = LinkParams {
            peer_id: peer_id.clone(),
            negotiation_id,
            direction,
            remote_offer,
            remote_candidates,
            outgoing,
            ice_servers: self.ice_servers.clone(),
            negotiation_timeout: self.negotiation_timeout,
        };
        let (handle, task) = LinkActor::spawn(
            params,
            Arc::clone(&self.transport),
            self.link_events.clone(),
            self.cancel_token.child_token(),
        );
        self.metrics.link_created();

        info!(
            target: "mesh.session.peers",
            peer_id = %peer_id,
            negotiation_id = %negotiation_id,
            direction = direction.as_str(),
            "Peer link started"
        );

        Some(PeerLink {
            handle,
            task,
            state: ConnectionState::Connecting,
            remote_stream: None,
            started_at: Instant::now(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{TrackKind, TrackSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConnection {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn create_offer(&self) -> Result<String, LinkError> {
            Ok("v=0 offer".to_string())
        }

        async fn accept_offer(&self, _sdp: String) -> Result<String, LinkError> {
            Ok("v=0 answer".to_string())
        }

        async fn accept_answer(&self, _sdp: String) -> Result<(), LinkError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), LinkError> {
            Ok(())
        }

        async fn replace_video_track(&self, _track: Option<MediaTrack>) -> Result<(), LinkError> {
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records each connect; keeps transport event senders alive.
    #[derive(Default)]
    struct FakeTransport {
        connects: Mutex<Vec<(PeerId, LinkDirection)>>,
        senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn connect(&self, setup: LinkSetup) -> Result<Arc<dyn PeerConnection>, LinkError> {
            self.connects
                .lock()
                .unwrap()
                .push((setup.peer_id.clone(), setup.direction));
            self.senders.lock().unwrap().push(setup.events);
            Ok(Arc::new(FakeConnection {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    struct Harness {
        manager: PeerConnectionManager,
        transport: Arc<FakeTransport>,
        metrics: Arc<SessionMetrics>,
        _events: mpsc::Receiver<LinkEvent>,
    }

    fn harness(local: &str) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let metrics = SessionMetrics::new();
        let (events_tx, events_rx) = mpsc::channel(256);
        let manager = PeerConnectionManager::new(
            PeerId::from(local),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            vec!["stun:stun.l.google.com:19302".to_string()],
            Duration::from_secs(15),
            events_tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        Harness {
            manager,
            transport,
            metrics,
            _events: events_rx,
        }
    }

    fn media() -> OutgoingMedia {
        OutgoingMedia {
            audio: Some(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone)),
            video: Some(MediaTrack::new(TrackKind::Video, TrackSource::Camera)),
        }
    }

    #[tokio::test]
    async fn test_ensure_link_queues_until_media_ready() {
        let mut h = harness("alice");
        let bob = PeerId::from("bob");

        assert_eq!(h.manager.ensure_link(&bob), EnsureOutcome::Queued);
        assert_eq!(h.manager.link_count(), 0);
        assert_eq!(
            h.manager.connection_state(&bob),
            Some(ConnectionState::AwaitingConnection)
        );

        assert_eq!(h.manager.set_outgoing_media(media()), 1);
        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(
            h.manager.link_direction(&bob),
            Some(LinkDirection::Outbound)
        );
        assert_eq!(h.metrics.snapshot().links_created, 1);
    }

    #[tokio::test]
    async fn test_ensure_link_is_idempotent() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");

        assert_eq!(h.manager.ensure_link(&bob), EnsureOutcome::Created);
        assert_eq!(h.manager.ensure_link(&bob), EnsureOutcome::AlreadyPresent);
        assert_eq!(
            h.manager.ensure_link(&PeerId::from("alice")),
            EnsureOutcome::IgnoredSelf
        );
        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.metrics.snapshot().links_created, 1);
    }

    #[tokio::test]
    async fn test_lower_id_keeps_outbound_on_collision() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");
        h.manager.ensure_link(&bob);
        let ours = h.manager.negotiation_id(&bob).unwrap();

        let outcome = h
            .manager
            .accept_inbound(&bob, NegotiationId::new(), "v=0 bob".to_string());

        assert_eq!(outcome, InboundOutcome::Ignored);
        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.manager.link_direction(&bob), Some(LinkDirection::Outbound));
        assert_eq!(h.manager.negotiation_id(&bob), Some(ours));
    }

    #[tokio::test]
    async fn test_higher_id_yields_to_inbound_on_collision() {
        let mut h = harness("bob");
        h.manager.set_outgoing_media(media());
        let alice = PeerId::from("alice");
        h.manager.ensure_link(&alice);
        let role_before = h.manager.sessions().first().unwrap().display_role;
        let theirs = NegotiationId::new();

        let outcome = h
            .manager
            .accept_inbound(&alice, theirs, "v=0 alice".to_string());

        assert_eq!(outcome, InboundOutcome::Replaced);
        assert_eq!(h.manager.link_count(), 1);
        assert_eq!(h.manager.link_direction(&alice), Some(LinkDirection::Inbound));
        assert_eq!(h.manager.negotiation_id(&alice), Some(theirs));
        assert_eq!(
            h.manager.sessions().first().unwrap().display_role,
            role_before
        );
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.links_created, 2);
        assert_eq!(snapshot.links_closed, 1);
        assert_eq!(snapshot.links_active, 1);
    }

    #[tokio::test]
    async fn test_repeated_offer_ignored_and_restart_replaces() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let zed = PeerId::from("zed");
        let first = NegotiationId::new();

        assert_eq!(
            h.manager.accept_inbound(&zed, first, "v=0 1".to_string()),
            InboundOutcome::Accepted
        );
        assert_eq!(
            h.manager.accept_inbound(&zed, first, "v=0 1".to_string()),
            InboundOutcome::Ignored
        );

        let second = NegotiationId::new();
        assert_eq!(
            h.manager.accept_inbound(&zed, second, "v=0 2".to_string()),
            InboundOutcome::Replaced
        );
        assert_eq!(h.manager.negotiation_id(&zed), Some(second));
        assert_eq!(h.manager.link_count(), 1);
    }

    #[tokio::test]
    async fn test_queued_offer_latest_wins() {
        let mut h = harness("alice");
        let bob = PeerId::from("bob");
        let first = NegotiationId::new();
        let latest = NegotiationId::new();

        assert_eq!(
            h.manager.accept_inbound(&bob, first, "v=0 1".to_string()),
            InboundOutcome::Queued
        );
        assert_eq!(
            h.manager.accept_inbound(&bob, latest, "v=0 2".to_string()),
            InboundOutcome::Queued
        );
        assert_eq!(h.manager.peer_count(), 1);

        h.manager.set_outgoing_media(media());

        assert_eq!(h.manager.link_direction(&bob), Some(LinkDirection::Inbound));
        assert_eq!(h.manager.negotiation_id(&bob), Some(latest));
    }

    #[tokio::test]
    async fn test_candidates_held_with_queued_offer() {
        let mut h = harness("alice");
        let bob = PeerId::from("bob");
        let nid = NegotiationId::new();
        h.manager.accept_inbound(&bob, nid, "v=0".to_string());

        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        };
        assert!(h.manager.route_candidate(&bob, nid, candidate.clone()).await);
        assert!(
            !h.manager
                .route_candidate(&bob, NegotiationId::new(), candidate)
                .await
        );
    }

    #[tokio::test]
    async fn test_stale_answer_dropped() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");
        h.manager.ensure_link(&bob);
        let current = h.manager.negotiation_id(&bob).unwrap();

        assert!(
            !h.manager
                .route_answer(&bob, NegotiationId::new(), "v=0".to_string())
                .await
        );
        assert!(h.manager.route_answer(&bob, current, "v=0".to_string()).await);
        assert!(
            !h.manager
                .route_answer(&PeerId::from("carol"), current, "v=0".to_string())
                .await
        );
    }

    #[tokio::test]
    async fn test_remote_stream_marks_connected() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");
        h.manager.ensure_link(&bob);
        let nid = h.manager.negotiation_id(&bob).unwrap();
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, TrackSource::Remote)]);

        assert!(!h
            .manager
            .on_remote_stream(&bob, NegotiationId::new(), stream.clone()));
        assert!(h.manager.on_remote_stream(&bob, nid, stream));

        let sessions = h.manager.sessions();
        let session = sessions.first().unwrap();
        assert_eq!(session.connection_state, ConnectionState::Connected);
        assert!(session.stream.is_some());
        assert!(!session.is_local);

        let closed = h.manager.close_link(&bob).unwrap();
        assert!(closed.had_link);
        assert!(closed.was_connected);
    }

    #[tokio::test]
    async fn test_link_failure_removes_only_current_attempt() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");
        h.manager.ensure_link(&bob);
        let nid = h.manager.negotiation_id(&bob).unwrap();

        assert!(!h
            .manager
            .on_link_failed(&bob, NegotiationId::new(), &LinkError::TimedOut));
        assert!(h.manager.contains(&bob));

        assert!(h.manager.on_link_failed(&bob, nid, &LinkError::TimedOut));
        assert!(!h.manager.contains(&bob));
        assert_eq!(h.metrics.snapshot().link_failures, 1);
    }

    #[tokio::test]
    async fn test_close_link_is_idempotent() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        let bob = PeerId::from("bob");
        h.manager.ensure_link(&bob);

        let closed = h.manager.close_link(&bob).unwrap();
        assert!(closed.had_link);
        assert!(!closed.was_connected);
        assert!(h.manager.close_link(&bob).is_none());
        assert_eq!(h.metrics.snapshot().links_closed, 1);
    }

    #[tokio::test]
    async fn test_close_all_closes_every_link_and_queued_intent() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        for peer in ["bob", "carol", "dave"] {
            h.manager.ensure_link(&PeerId::from(peer));
        }
        // Let each link actor open its connection.
        while h.transport.connects.lock().unwrap().len() < 3 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.manager.close_all().await, 3);

        assert_eq!(h.manager.peer_count(), 0);
        assert_eq!(h.transport.closes.load(Ordering::SeqCst), 3);
        assert_eq!(h.metrics.link_count(), 0);

        // Intents queued after close wait for new media.
        assert_eq!(
            h.manager.ensure_link(&PeerId::from("erin")),
            EnsureOutcome::Queued
        );
    }

    #[tokio::test]
    async fn test_reconcile_matches_roster() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        h.manager.ensure_link(&PeerId::from("bob"));
        h.manager.ensure_link(&PeerId::from("carol"));

        let roster = vec![
            PeerId::from("alice"),
            PeerId::from("carol"),
            PeerId::from("dave"),
        ];
        let summary = h.manager.reconcile(&roster);

        assert_eq!(summary.added, vec![PeerId::from("dave")]);
        assert_eq!(summary.removed, vec![PeerId::from("bob")]);
        assert_eq!(h.manager.peer_count(), 2);
        assert!(!h.manager.contains(&PeerId::from("alice")));
    }

    #[tokio::test]
    async fn test_sessions_ordered_by_arrival_with_cycling_roles() {
        let mut h = harness("alice");
        for peer in ["zed", "bob", "mia", "carl"] {
            h.manager.ensure_link(&PeerId::from(peer));
        }

        let sessions = h.manager.sessions();
        let order: Vec<&str> = sessions.iter().map(|s| s.peer_id.as_str()).collect();
        assert_eq!(order, vec!["zed", "bob", "mia", "carl"]);
        let roles: Vec<DisplayRole> = sessions.iter().map(|s| s.display_role).collect();
        assert_eq!(
            roles,
            vec![
                DisplayRole::Presenter,
                DisplayRole::CoOrganizer,
                DisplayRole::Attendee,
                DisplayRole::Presenter
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_outgoing_video_updates_links_and_future_media() {
        let mut h = harness("alice");
        h.manager.set_outgoing_media(media());
        h.manager.ensure_link(&PeerId::from("bob"));
        h.manager.ensure_link(&PeerId::from("carol"));

        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Screen);
        assert_eq!(h.manager.replace_outgoing_video(Some(screen)).await, 2);
    }
}
