//! `LinkActor` - one task per remote peer media link.
//!
//! Each `LinkActor`:
//! - Owns exactly one `PeerConnection` from the `PeerTransport`
//! - Negotiates it as offerer (outbound) or answerer (inbound)
//! - Relays local SDP and ICE candidates upward as `LinkEvent::Signal`
//! - Reports `Connected` once remote media arrives, or `Failed` and exits
//!
//! # Lifecycle
//!
//! 1. Spawned by `PeerConnectionManager` once local media is ready
//! 2. Runs until its handle is dropped, it is cancelled, it fails, or the
//!    negotiation deadline passes without remote media
//! 3. Cancellation via child token propagates from the manager

use super::messages::{LinkDirection, LinkEvent, LinkEventKind, LinkMessage};
use super::metrics::{ActorType, MailboxMonitor};
use crate::errors::{LinkError, SessionError};
use crate::media::{MediaTrack, OutgoingMedia};
use crate::peers::{LinkSetup, PeerConnection, PeerTransport, TransportEvent};
use crate::signaling::protocol::{IceCandidate, NegotiationId, NegotiationPayload};

use common::types::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the link mailbox.
const LINK_CHANNEL_BUFFER: usize = 64;

/// Buffer for events coming from the transport.
const TRANSPORT_EVENT_BUFFER: usize = 64;

/// Handle to a `LinkActor`.
#[derive(Clone, Debug)]
pub struct LinkActorHandle {
    sender: mpsc::Sender<LinkMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    negotiation_id: NegotiationId,
    direction: LinkDirection,
}

impl LinkActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn negotiation_id(&self) -> NegotiationId {
        self.negotiation_id
    }

    #[must_use]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// Deliver the remote answer to our offer.
    pub async fn remote_answer(&self, sdp: String) -> Result<(), SessionError> {
        self.send(LinkMessage::RemoteAnswer { sdp }).await
    }

    /// Deliver a trickled remote ICE candidate.
    pub async fn remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.send(LinkMessage::RemoteCandidate { candidate }).await
    }

    /// Swap the outgoing video source.
    pub async fn replace_video(&self, track: Option<MediaTrack>) -> Result<(), SessionError> {
        self.send(LinkMessage::ReplaceVideo { track }).await
    }

    async fn send(&self, message: LinkMessage) -> Result<(), SessionError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the link actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Parameters for one link attempt.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub peer_id: PeerId,
    pub negotiation_id: NegotiationId,
    pub direction: LinkDirection,
    /// Remote offer SDP; required for inbound links.
    pub remote_offer: Option<String>,
    /// Candidates that arrived with a queued offer, applied after answering.
    pub remote_candidates: Vec<IceCandidate>,
    pub outgoing: OutgoingMedia,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
}

/// The `LinkActor` implementation.
pub struct LinkActor {
    params: LinkParams,
    /// Message receiver.
    receiver: mpsc::Receiver<LinkMessage>,
    /// Cancellation token (child of the manager's token).
    cancel_token: CancellationToken,
    transport: Arc<dyn PeerTransport>,
    /// Upward event channel to the coordinator.
    events: mpsc::Sender<LinkEvent>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
    /// Whether remote media has arrived.
    connected: bool,
}

impl LinkActor {
    /// Spawn a new link actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        params: LinkParams,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::Sender<LinkEvent>,
        cancel_token: CancellationToken,
    ) -> (LinkActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(LINK_CHANNEL_BUFFER);

        let handle = LinkActorHandle {
            sender,
            cancel_token: cancel_token.clone(),
            peer_id: params.peer_id.clone(),
            negotiation_id: params.negotiation_id,
            direction: params.direction,
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Link, params.peer_id.as_str()),
            params,
            receiver,
            cancel_token,
            transport,
            events,
            connected: false,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.session.link",
        fields(
            peer_id = %self.params.peer_id,
            negotiation_id = %self.params.negotiation_id,
            direction = self.params.direction.as_str()
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "mesh.session.link",
            peer_id = %self.params.peer_id,
            direction = self.params.direction.as_str(),
            "LinkActor started"
        );

        let deadline = Instant::now() + self.params.negotiation_timeout;
        let (transport_tx, mut transport_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);

        let setup = LinkSetup {
            peer_id: self.params.peer_id.clone(),
            direction: self.params.direction,
            outgoing: self.params.outgoing.clone(),
            ice_servers: self.params.ice_servers.clone(),
            events: transport_tx,
        };

        let cancel_token = self.cancel_token.clone();
        let connection = tokio::select! {
            () = cancel_token.cancelled() => {
                self.log_stopped("cancelled");
                return;
            }
            () = tokio::time::sleep_until(deadline) => {
                self.report_failure(LinkError::TimedOut).await;
                self.log_stopped("timeout");
                return;
            }
            result = self.transport.connect(setup) => match result {
                Ok(connection) => connection,
                Err(e) => {
                    self.report_failure(e).await;
                    self.log_stopped("connect_failed");
                    return;
                }
            }
        };

        let negotiated = tokio::select! {
            () = cancel_token.cancelled() => {
                connection.close().await;
                self.log_stopped("cancelled");
                return;
            }
            () = tokio::time::sleep_until(deadline) => Err(LinkError::TimedOut),
            result = self.negotiate(connection.as_ref()) => result,
        };
        if let Err(e) = negotiated {
            self.report_failure(e).await;
            connection.close().await;
            self.log_stopped("negotiation_failed");
            return;
        }

        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);
        let mut transport_open = true;
        let mut exit_reason = "closed";

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    exit_reason = "cancelled";
                    break;
                }

                // Negotiation deadline, only until remote media arrives
                () = &mut timeout, if !self.connected => {
                    self.report_failure(LinkError::TimedOut).await;
                    exit_reason = "timeout";
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            let should_exit =
                                self.handle_message(connection.as_ref(), message).await;

                            if should_exit {
                                exit_reason = "failed";
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "mesh.session.link",
                                peer_id = %self.params.peer_id,
                                "LinkActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                // Handle transport events
                event = transport_rx.recv(), if transport_open => {
                    match event {
                        Some(event) => {
                            if self.handle_transport_event(event).await {
                                exit_reason = "failed";
                                break;
                            }
                        }
                        None => transport_open = false,
                    }
                }
            }
        }

        connection.close().await;
        self.log_stopped(exit_reason);
    }

    /// Produce the local offer or answer and send it upward.
    async fn negotiate(&self, connection: &dyn PeerConnection) -> Result<(), LinkError> {
        match self.params.direction {
            LinkDirection::Outbound => {
                let sdp = connection.create_offer().await?;
                debug!(
                    target: "mesh.session.link",
                    peer_id = %self.params.peer_id,
                    sdp_len = sdp.len(),
                    "Local offer created"
                );
                self.emit(LinkEventKind::Signal(NegotiationPayload::Offer { sdp }))
                    .await;
            }
            LinkDirection::Inbound => {
                let offer = self.params.remote_offer.clone().ok_or_else(|| {
                    LinkError::Negotiation("inbound link without remote offer".to_string())
                })?;
                let sdp = connection.accept_offer(offer).await?;
                debug!(
                    target: "mesh.session.link",
                    peer_id = %self.params.peer_id,
                    sdp_len = sdp.len(),
                    "Local answer created"
                );
                self.emit(LinkEventKind::Signal(NegotiationPayload::Answer { sdp }))
                    .await;
                for candidate in &self.params.remote_candidates {
                    if let Err(e) = connection.add_ice_candidate(candidate.clone()).await {
                        debug!(
                            target: "mesh.session.link",
                            peer_id = %self.params.peer_id,
                            error = %e,
                            "Queued candidate rejected"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(
        &mut self,
        connection: &dyn PeerConnection,
        message: LinkMessage,
    ) -> bool {
        match message {
            LinkMessage::RemoteAnswer { sdp } => {
                if self.params.direction != LinkDirection::Outbound {
                    debug!(
                        target: "mesh.session.link",
                        peer_id = %self.params.peer_id,
                        "Answer for inbound link ignored"
                    );
                    return false;
                }
                match connection.accept_answer(sdp).await {
                    Ok(()) => false,
                    Err(e) => {
                        self.report_failure(e).await;
                        true
                    }
                }
            }

            LinkMessage::RemoteCandidate { candidate } => {
                // A rejected candidate is not fatal; others may still succeed.
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    debug!(
                        target: "mesh.session.link",
                        peer_id = %self.params.peer_id,
                        error = %e,
                        "Remote candidate rejected"
                    );
                }
                false
            }

            LinkMessage::ReplaceVideo { track } => {
                let track_id = track.as_ref().map(|t| t.id().to_string());
                if let Err(e) = connection.replace_video_track(track).await {
                    warn!(
                        target: "mesh.session.link",
                        peer_id = %self.params.peer_id,
                        error = %e,
                        "Failed to replace outgoing video"
                    );
                } else {
                    debug!(
                        target: "mesh.session.link",
                        peer_id = %self.params.peer_id,
                        track_id = ?track_id,
                        "Outgoing video replaced"
                    );
                }
                false
            }
        }
    }

    /// Handle a transport event. Returns true if the actor should exit.
    async fn handle_transport_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.emit(LinkEventKind::Signal(NegotiationPayload::Candidate(
                    candidate,
                )))
                .await;
                false
            }
            TransportEvent::RemoteStream(stream) => {
                if !self.connected {
                    self.connected = true;
                    info!(
                        target: "mesh.session.link",
                        peer_id = %self.params.peer_id,
                        direction = self.params.direction.as_str(),
                        "Peer link connected"
                    );
                }
                self.emit(LinkEventKind::Connected(stream)).await;
                false
            }
            TransportEvent::Failed(reason) => {
                self.report_failure(LinkError::Transport(reason)).await;
                true
            }
            TransportEvent::Closed => {
                self.report_failure(LinkError::Closed).await;
                true
            }
        }
    }

    async fn report_failure(&self, error: LinkError) {
        warn!(
            target: "mesh.session.link",
            peer_id = %self.params.peer_id,
            reason = error.as_label(),
            error = %error,
            "Peer link failed"
        );
        self.emit(LinkEventKind::Failed(error)).await;
    }

    async fn emit(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            peer_id: self.params.peer_id.clone(),
            negotiation_id: self.params.negotiation_id,
            kind,
        };
        if self.events.send(event).await.is_err() {
            debug!(
                target: "mesh.session.link",
                peer_id = %self.params.peer_id,
                "Link event dropped, coordinator gone"
            );
        }
    }

    fn log_stopped(&self, reason: &str) {
        info!(
            target: "mesh.session.link",
            peer_id = %self.params.peer_id,
            reason = reason,
            messages_processed = self.mailbox.messages_processed(),
            "LinkActor stopped"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{MediaStream, TrackKind, TrackSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConnection {
        closed: AtomicBool,
        answers: Mutex<Vec<String>>,
        candidates: Mutex<Vec<IceCandidate>>,
        video: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn create_offer(&self) -> Result<String, LinkError> {
            Ok("v=0 offer".to_string())
        }

        async fn accept_offer(&self, sdp: String) -> Result<String, LinkError> {
            Ok(format!("answer-to:{sdp}"))
        }

        async fn accept_answer(&self, sdp: String) -> Result<(), LinkError> {
            self.answers.lock().unwrap().push(sdp);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn replace_video_track(&self, track: Option<MediaTrack>) -> Result<(), LinkError> {
            *self.video.lock().unwrap() = track.map(|t| t.id().to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        connection: Arc<FakeConnection>,
        events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn connect(&self, setup: LinkSetup) -> Result<Arc<dyn PeerConnection>, LinkError> {
            *self.events.lock().unwrap() = Some(setup.events);
            Ok(Arc::clone(&self.connection) as Arc<dyn PeerConnection>)
        }
    }

    impl FakeTransport {
        fn events(&self) -> mpsc::Sender<TransportEvent> {
            self.events.lock().unwrap().clone().unwrap()
        }
    }

    fn params(direction: LinkDirection, remote_offer: Option<&str>) -> LinkParams {
        LinkParams {
            peer_id: PeerId::from("bob"),
            negotiation_id: NegotiationId::new(),
            direction,
            remote_offer: remote_offer.map(str::to_string),
            remote_candidates: Vec::new(),
            outgoing: OutgoingMedia::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            negotiation_timeout: Duration::from_secs(15),
        }
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_outbound_link_sends_offer() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.peer_id, PeerId::from("bob"));
        assert_eq!(event.negotiation_id, handle.negotiation_id());
        assert!(matches!(
            event.kind,
            LinkEventKind::Signal(NegotiationPayload::Offer { .. })
        ));

        handle.remote_answer("v=0 answer".to_string()).await.unwrap();
        // Dropping the handle drains the mailbox, then the link closes.
        drop(handle);
        task.await.unwrap();

        assert_eq!(
            transport.connection.answers.lock().unwrap().as_slice(),
            ["v=0 answer".to_string()]
        );
        assert!(transport.connection.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_inbound_link_answers_and_applies_queued_candidates() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut link = params(LinkDirection::Inbound, Some("v=0 remote"));
        link.remote_candidates = vec![candidate()];
        let (handle, task) = LinkActor::spawn(
            link,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(
            &event.kind,
            LinkEventKind::Signal(NegotiationPayload::Answer { sdp }) if sdp == "answer-to:v=0 remote"
        ));

        // Dropping the handle drains the mailbox, then the link closes.
        drop(handle);
        task.await.unwrap();
        assert_eq!(transport.connection.candidates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_link_without_offer_fails() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_handle, task) = LinkActor::spawn(
            params(LinkDirection::Inbound, None),
            transport as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            LinkEventKind::Failed(LinkError::Negotiation(_))
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_stream_reports_connected_and_candidates_relay() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );
        let _offer = events_rx.recv().await.unwrap();

        let transport_events = transport.events();
        transport_events
            .send(TransportEvent::LocalCandidate(candidate()))
            .await
            .unwrap();
        let remote = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, TrackSource::Remote)]);
        transport_events
            .send(TransportEvent::RemoteStream(remote))
            .await
            .unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            LinkEventKind::Signal(NegotiationPayload::Candidate(_))
        ));
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.kind, LinkEventKind::Connected(_)));

        handle.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_reports_failure() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );
        let _offer = events_rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.kind, LinkEventKind::Failed(LinkError::TimedOut)));
        task.await.unwrap();
        assert!(transport.connection.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_link() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );
        let _offer = events_rx.recv().await.unwrap();

        transport
            .events()
            .send(TransportEvent::Failed("ice failed".to_string()))
            .await
            .unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            LinkEventKind::Failed(LinkError::Transport(_))
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_video_reaches_connection() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            events_tx,
            CancellationToken::new(),
        );
        let _offer = events_rx.recv().await.unwrap();

        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Screen);
        handle.replace_video(Some(screen.clone())).await.unwrap();
        // Dropping the handle drains the mailbox, then the link closes.
        drop(handle);
        task.await.unwrap();

        assert_eq!(
            transport.connection.video.lock().unwrap().as_deref(),
            Some(screen.id())
        );
    }

    #[tokio::test]
    async fn test_link_cancellation_before_connect() {
        let transport = Arc::new(FakeTransport::default());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();
        let (handle, task) = LinkActor::spawn(
            params(LinkDirection::Outbound, None),
            transport as Arc<dyn PeerTransport>,
            events_tx,
            cancel_token,
        );

        assert!(handle.is_cancelled());
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }
}
