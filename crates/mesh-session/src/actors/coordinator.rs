//! `SessionCoordinator` - the call state machine for one local participant.
//!
//! The coordinator:
//! - Owns the `SignalingClient`, `MediaController` and `PeerConnectionManager`
//! - Drives `Idle -> Joining -> InCall -> Leaving -> Idle`
//! - Publishes a `CallSnapshot` after every change and broadcasts notices
//!
//! Intents, signaling events, link events and async completions (media,
//! relay dial, display capture) all arrive on one `select!` loop, so the
//! peer map and participant list never see concurrent mutation.
//!
//! # Join attempts
//!
//! Media acquisition and the signaling join race. `Joining` tracks both
//! halves and moves to `InCall` once media is ready and a roster arrived.
//! Every async completion carries the attempt number it was started for; a
//! completion from an earlier attempt is discarded and any media it carries
//! is stopped.
//!
//! # Signaling loss
//!
//! `ConnectionLost` marks signaling degraded but keeps every link. If the
//! relay is not restored within the grace period, or reconnecting fails, the
//! call ends with `SignalingDisconnected`.

use super::messages::{
    CallSnapshot, CallState, ChatMessage, ConnectionState, DisplayRole, JoinOptions, JoinResult,
    LinkEvent, LinkEventKind, ParticipantSession, SessionMessage, SessionNotice, SignalingStatus,
};
use super::metrics::{ActorType, MailboxMonitor, SessionMetrics, SessionMetricsSnapshot};
use crate::config::SessionConfig;
use crate::errors::{MediaError, SessionError, SignalingError};
use crate::media::{
    LocalMediaState, MediaConstraints, MediaController, MediaDevices, MediaStream,
};
use crate::observability;
use crate::peers::{InboundOutcome, PeerConnectionManager, PeerTransport};
use crate::signaling::{
    NegotiationPayload, RelayConnection, RelayConnector, SignalingClient, SignalingEvent,
};

use chrono::Utc;
use common::types::{MessageId, PeerId, RoomId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Buffer for signaling events from the relay supervisor.
const SIGNALING_EVENT_BUFFER: usize = 256;

/// Buffer for events from link actors.
const LINK_EVENT_BUFFER: usize = 256;

/// Buffer for async completions.
const COMPLETION_BUFFER: usize = 32;

/// Capacity of the notice broadcast channel.
const NOTICE_BUFFER: usize = 64;

/// How often join and grace deadlines are checked.
const DEADLINE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// External collaborators the session runs against.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub relay: Arc<dyn RelayConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub transport: Arc<dyn PeerTransport>,
}

/// Handle to a `SessionCoordinator`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    local_id: PeerId,
    snapshots: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    metrics: Arc<SessionMetrics>,
}

impl SessionHandle {
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Join `room_id`. Resolves once in the call or when the attempt fails.
    pub async fn join(
        &self,
        room_id: RoomId,
        options: JoinOptions,
    ) -> Result<JoinResult, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Join {
            room_id,
            options,
            respond_to: tx,
        })
        .await?;
        Self::receive(rx).await?
    }

    /// Leave the call, or cancel a join in progress.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Leave { respond_to: tx }).await?;
        Self::receive(rx).await?
    }

    /// Returns false if there is no camera track.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::SetVideoEnabled {
            enabled,
            respond_to: tx,
        })
        .await?;
        Self::receive(rx).await
    }

    /// Returns false if there is no microphone track.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::SetAudioEnabled {
            enabled,
            respond_to: tx,
        })
        .await?;
        Self::receive(rx).await
    }

    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::StartScreenShare { respond_to: tx })
            .await?;
        Self::receive(rx).await?
    }

    /// Returns false if no screen share was active.
    pub async fn stop_screen_share(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::StopScreenShare { respond_to: tx })
            .await?;
        Self::receive(rx).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::SendChat {
            text: text.into(),
            respond_to: tx,
        })
        .await?;
        Self::receive(rx).await?
    }

    /// Ask the actor for a fresh snapshot.
    pub async fn snapshot(&self) -> Result<CallSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetSnapshot { respond_to: tx })
            .await?;
        Self::receive(rx).await
    }

    /// The last published snapshot, without a round trip.
    #[must_use]
    pub fn current(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified on every published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Subscribe to informational notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> SessionMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// End any call, close signaling and stop the actor.
    pub async fn dispose(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::Dispose { respond_to: tx }).await?;
        Self::receive(rx).await
    }

    /// Cancel the coordinator actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), SessionError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    async fn receive<T>(rx: oneshot::Receiver<T>) -> Result<T, SessionError> {
        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }
}

/// Results of work started off the actor loop.
enum Completion {
    Media {
        attempt: u64,
        result: Result<MediaStream, MediaError>,
    },
    Relay {
        attempt: u64,
        result: Result<RelayConnection, SignalingError>,
    },
    Display {
        attempt: u64,
        result: Result<MediaStream, MediaError>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    ScreenTrackEnded {
        track_id: String,
    },
}

/// The join attempt in progress.
struct PendingJoin {
    room_id: RoomId,
    respond_to: oneshot::Sender<Result<JoinResult, SessionError>>,
    /// Reduced constraints still to try if media fails.
    fallbacks: VecDeque<MediaConstraints>,
    degraded: bool,
    deadline: Instant,
    roster_size: usize,
}

/// The `SessionCoordinator` implementation.
pub struct SessionCoordinator {
    local_id: PeerId,
    config: SessionConfig,
    /// Message receiver.
    receiver: mpsc::Receiver<SessionMessage>,
    /// Cancellation token (parent of signaling and link tokens).
    cancel_token: CancellationToken,
    signaling: SignalingClient,
    signaling_rx: mpsc::Receiver<SignalingEvent>,
    media: MediaController,
    peers: PeerConnectionManager,
    link_rx: mpsc::Receiver<LinkEvent>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    state: CallState,
    room_id: Option<RoomId>,
    /// Incremented on every join.
    attempt: u64,
    pending_join: Option<PendingJoin>,
    /// Our `join-room` was sent and the relay has not answered it yet.
    join_reply_outstanding: bool,
    /// Relay answers still due for joins abandoned on this connection.
    stale_join_replies: u32,
    chat: Vec<ChatMessage>,
    signaling_status: SignalingStatus,
    /// Set while signaling is degraded during a call.
    grace_deadline: Option<Instant>,
    last_join_failure: Option<SessionError>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    /// Shared metrics.
    metrics: Arc<SessionMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl SessionCoordinator {
    /// Spawn a new session coordinator for `local_id`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        config: SessionConfig,
        local_id: PeerId,
        collaborators: SessionCollaborators,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (signaling_tx, signaling_rx) = mpsc::channel(SIGNALING_EVENT_BUFFER);
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_BUFFER);
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let metrics = SessionMetrics::new();

        let signaling = SignalingClient::new(
            collaborators.relay,
            config.retry_policy(),
            signaling_tx,
            cancel_token.child_token(),
        );
        let media = MediaController::new(collaborators.devices, Arc::clone(&metrics));
        let peers = PeerConnectionManager::new(
            local_id.clone(),
            collaborators.transport,
            config.stun_urls.clone(),
            config.negotiation_timeout(),
            link_tx,
            cancel_token.child_token(),
            Arc::clone(&metrics),
        );

        let mut actor = Self {
            local_id: local_id.clone(),
            config,
            receiver,
            cancel_token: cancel_token.clone(),
            signaling,
            signaling_rx,
            media,
            peers,
            link_rx,
            completion_tx,
            completion_rx,
            state: CallState::Idle,
            room_id: None,
            attempt: 0,
            pending_join: None,
            join_reply_outstanding: false,
            stale_join_replies: 0,
            chat: Vec::new(),
            signaling_status: SignalingStatus::Disconnected,
            grace_deadline: None,
            last_join_failure: None,
            snapshot_tx: watch::channel(Self::idle_snapshot(&local_id)).0,
            notices: notices.clone(),
            metrics: Arc::clone(&metrics),
            mailbox: MailboxMonitor::new(ActorType::Coordinator, local_id.as_str()),
        };
        let snapshots = actor.snapshot_tx.subscribe();
        actor.publish();

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            local_id,
            snapshots,
            notices,
            metrics,
        };

        (handle, task_handle)
    }

    fn idle_snapshot(local_id: &PeerId) -> CallSnapshot {
        CallSnapshot {
            state: CallState::Idle,
            room_id: None,
            local_peer_id: local_id.clone(),
            participants: Vec::new(),
            local_media: LocalMediaState::default(),
            chat: Vec::new(),
            signaling: SignalingStatus::Disconnected,
            last_join_failure: None,
        }
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.session.coordinator",
        fields(local_id = %self.local_id)
    )]
    async fn run(mut self) {
        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            "SessionCoordinator started"
        );

        let mut deadline_check = tokio::time::interval(DEADLINE_CHECK_INTERVAL);

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.session.coordinator",
                        local_id = %self.local_id,
                        "SessionCoordinator received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                // Join and signaling grace deadlines
                _ = deadline_check.tick() => {
                    self.check_deadlines().await;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "mesh.session.coordinator",
                                local_id = %self.local_id,
                                "SessionCoordinator channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                Some(event) = self.signaling_rx.recv() => {
                    self.handle_signaling_event(event).await;
                }

                Some(event) = self.link_rx.recv() => {
                    self.handle_link_event(event).await;
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
            }

            self.publish();
        }

        self.publish();
        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionCoordinator stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Join {
                room_id,
                options,
                respond_to,
            } => {
                self.handle_join(room_id, options, respond_to).await;
                false
            }

            SessionMessage::Leave { respond_to } => {
                let result = self.handle_leave().await;
                let _ = respond_to.send(result);
                false
            }

            SessionMessage::SetVideoEnabled {
                enabled,
                respond_to,
            } => {
                let _ = respond_to.send(self.media.set_video_enabled(enabled));
                false
            }

            SessionMessage::SetAudioEnabled {
                enabled,
                respond_to,
            } => {
                let _ = respond_to.send(self.media.set_audio_enabled(enabled));
                false
            }

            SessionMessage::StartScreenShare { respond_to } => {
                self.handle_start_screen_share(respond_to);
                false
            }

            SessionMessage::StopScreenShare { respond_to } => {
                let stopped = self.media.stop_screen_share(&mut self.peers).await;
                let _ = respond_to.send(stopped);
                false
            }

            SessionMessage::SendChat { text, respond_to } => {
                let result = self.handle_send_chat(text).await;
                let _ = respond_to.send(result);
                false
            }

            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.build_snapshot());
                false
            }

            SessionMessage::Dispose { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    /// Start a join attempt: media and signaling run concurrently.
    async fn handle_join(
        &mut self,
        room_id: RoomId,
        options: JoinOptions,
        respond_to: oneshot::Sender<Result<JoinResult, SessionError>>,
    ) {
        if self.state != CallState::Idle {
            let _ = respond_to.send(Err(SessionError::InvalidState(format!(
                "cannot join while {}",
                self.state.as_str()
            ))));
            return;
        }
        if options.constraints.is_empty() {
            let _ = respond_to.send(Err(SessionError::InvalidState(
                "join requires audio or video".to_string(),
            )));
            return;
        }

        self.attempt += 1;
        self.chat.clear();
        self.last_join_failure = None;
        self.grace_deadline = None;
        self.room_id = Some(room_id.clone());
        self.state = CallState::Joining {
            media_ready: false,
            roster_received: false,
        };
        self.pending_join = Some(PendingJoin {
            room_id: room_id.clone(),
            respond_to,
            fallbacks: options.constraints.fallbacks().into(),
            degraded: false,
            deadline: Instant::now() + self.config.join_timeout(),
            roster_size: 0,
        });

        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            room_id = %room_id,
            attempt = self.attempt,
            constraints = options.constraints.describe(),
            "Joining room"
        );

        self.request_media(options.constraints);

        let joined = if self.signaling.is_connected() {
            self.signaling.join_room(&room_id, &self.local_id).await
        } else {
            Err(SignalingError::Disconnected)
        };
        match joined {
            Ok(()) => self.join_reply_outstanding = true,
            Err(_) => self.dial_relay(),
        }
    }

    fn request_media(&self, constraints: MediaConstraints) {
        let request = self.media.request(constraints);
        let completions = self.completion_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = request.await;
            let _ = completions.send(Completion::Media { attempt, result }).await;
        });
    }

    fn dial_relay(&self) {
        let dial = self.signaling.dial();
        let completions = self.completion_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = dial.await;
            let _ = completions.send(Completion::Relay { attempt, result }).await;
        });
    }

    fn is_current_join(&self, attempt: u64) -> bool {
        attempt == self.attempt && matches!(self.state, CallState::Joining { .. })
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Media { attempt, result } => self.on_media_result(attempt, result).await,
            Completion::Relay { attempt, result } => self.on_relay_result(attempt, result).await,
            Completion::Display {
                attempt,
                result,
                respond_to,
            } => {
                let outcome = self.on_display_result(attempt, result).await;
                let _ = respond_to.send(outcome);
            }
            Completion::ScreenTrackEnded { track_id } => {
                if self.media.is_current_screen_track(&track_id) {
                    self.media.stop_screen_share(&mut self.peers).await;
                    self.notify(SessionNotice::ScreenShareEnded);
                }
            }
        }
    }

    async fn on_media_result(&mut self, attempt: u64, result: Result<MediaStream, MediaError>) {
        if !self.is_current_join(attempt) {
            if let Ok(stream) = result {
                let stopped = stream.stop_all();
                info!(
                    target: "mesh.session.coordinator",
                    attempt = attempt,
                    tracks_stopped = stopped,
                    "Media from abandoned join released"
                );
            }
            return;
        }

        match result {
            Ok(stream) => {
                self.media.install(stream);
                if let CallState::Joining { media_ready, .. } = &mut self.state {
                    *media_ready = true;
                }
                if let Some(outgoing) = self.media.outgoing() {
                    self.peers.set_outgoing_media(outgoing);
                }
                self.try_complete_join();
            }
            Err(e) => {
                let fallback = if self.config.allow_degraded_media && e.is_relaxable() {
                    self.pending_join.as_mut().and_then(|p| {
                        p.degraded = true;
                        p.fallbacks.pop_front()
                    })
                } else {
                    None
                };
                match fallback {
                    Some(constraints) => {
                        info!(
                            target: "mesh.session.coordinator",
                            error = e.as_label(),
                            constraints = constraints.describe(),
                            "Retrying media with reduced constraints"
                        );
                        self.request_media(constraints);
                    }
                    None => self.fail_join(e.into()).await,
                }
            }
        }
    }

    async fn on_relay_result(
        &mut self,
        attempt: u64,
        result: Result<RelayConnection, SignalingError>,
    ) {
        if !self.is_current_join(attempt) {
            debug!(
                target: "mesh.session.coordinator",
                attempt = attempt,
                "Relay connection from abandoned join dropped"
            );
            return;
        }

        let joined = match result {
            Ok(connection) => {
                self.signaling.attach(connection);
                self.signaling_status = SignalingStatus::Connected;
                match &self.room_id {
                    Some(room_id) => self.signaling.join_room(room_id, &self.local_id).await,
                    None => Err(SignalingError::Disconnected),
                }
            }
            Err(e) => Err(e),
        };

        match joined {
            Ok(()) => self.join_reply_outstanding = true,
            Err(e) => {
                warn!(
                    target: "mesh.session.coordinator",
                    error = %e,
                    "Relay unavailable for join"
                );
                self.fail_join(e.into()).await;
            }
        }
    }

    async fn on_display_result(
        &mut self,
        attempt: u64,
        result: Result<MediaStream, MediaError>,
    ) -> Result<(), SessionError> {
        let display = result?;
        if attempt != self.attempt || self.state != CallState::InCall {
            display.stop_all();
            return Err(SessionError::InvalidState(
                "call ended before screen capture started".to_string(),
            ));
        }

        let track = self
            .media
            .start_screen_share(display, &mut self.peers)
            .await?;

        let ended = track.ended();
        let track_id = track.id().to_string();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            ended.await;
            let _ = completions
                .send(Completion::ScreenTrackEnded { track_id })
                .await;
        });
        Ok(())
    }

    /// Enter `InCall` once both media and roster are in.
    fn try_complete_join(&mut self) {
        if self.state
            != (CallState::Joining {
                media_ready: true,
                roster_received: true,
            })
        {
            return;
        }
        let Some(pending) = self.pending_join.take() else {
            return;
        };

        self.state = CallState::InCall;
        let result = JoinResult {
            room_id: pending.room_id,
            roster_size: pending.roster_size,
            degraded_media: pending.degraded,
        };
        observability::record_join("success");
        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            room_id = %result.room_id,
            roster_size = result.roster_size,
            degraded_media = result.degraded_media,
            links = self.peers.link_count(),
            "Call started"
        );
        let _ = pending.respond_to.send(Ok(result));
    }

    /// Abort the join attempt with `error`, releasing everything it acquired.
    async fn fail_join(&mut self, error: SessionError) {
        let pending = self.pending_join.take();
        self.teardown_call().await;
        self.last_join_failure = Some(error.clone());

        observability::record_join(error.error_type_label());
        warn!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            attempt = self.attempt,
            error = %error,
            "Join failed"
        );

        if let Some(pending) = pending {
            let _ = pending.respond_to.send(Err(error));
        }
    }

    /// End an active call. `cause` is `None` for a user-initiated leave.
    async fn end_call(&mut self, cause: Option<SessionError>) {
        self.state = CallState::Leaving;
        self.publish();
        self.teardown_call().await;
        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            cause = ?cause,
            "Call ended"
        );
        self.notify(SessionNotice::CallEnded { cause });
    }

    /// Close links, release media, announce departure, return to `Idle`.
    ///
    /// Every step runs regardless of the others.
    async fn teardown_call(&mut self) {
        let links_closed = self.peers.close_all().await;
        let tracks_stopped = self.media.release();

        // The relay still answers the join we are abandoning.
        if std::mem::take(&mut self.join_reply_outstanding) && self.signaling.is_connected() {
            self.stale_join_replies += 1;
        }

        if let Some(room_id) = self.room_id.take() {
            if let Err(e) = self.signaling.leave_room(&room_id, &self.local_id).await {
                debug!(
                    target: "mesh.session.coordinator",
                    error = %e,
                    "Leave intent not sent"
                );
            }
        }

        self.state = CallState::Idle;
        self.pending_join = None;
        self.grace_deadline = None;
        self.chat.clear();
        debug!(
            target: "mesh.session.coordinator",
            links_closed = links_closed,
            tracks_stopped = tracks_stopped,
            "Call resources released"
        );
    }

    async fn handle_leave(&mut self) -> Result<(), SessionError> {
        match self.state {
            CallState::Idle | CallState::Leaving => {
                Err(SessionError::InvalidState("not in a call".to_string()))
            }
            CallState::Joining { .. } => {
                self.fail_join(SessionError::JoinCancelled).await;
                Ok(())
            }
            CallState::InCall => {
                self.end_call(None).await;
                Ok(())
            }
        }
    }

    fn handle_start_screen_share(&self, respond_to: oneshot::Sender<Result<(), SessionError>>) {
        if self.state != CallState::InCall {
            let _ = respond_to.send(Err(SessionError::InvalidState(
                "screen share requires an active call".to_string(),
            )));
            return;
        }
        if self.media.is_screen_sharing() {
            let _ = respond_to.send(Ok(()));
            return;
        }

        let request = self.media.request_display();
        let completions = self.completion_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = request.await;
            let _ = completions
                .send(Completion::Display {
                    attempt,
                    result,
                    respond_to,
                })
                .await;
        });
    }

    async fn handle_send_chat(&mut self, text: String) -> Result<ChatMessage, SessionError> {
        if self.state != CallState::InCall {
            return Err(SessionError::InvalidState(
                "chat requires an active call".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let room_id = self
            .room_id
            .clone()
            .ok_or_else(|| SessionError::InvalidState("no room".to_string()))?;

        let message = ChatMessage {
            id: MessageId::generate(),
            text,
            sender_id: self.local_id.clone(),
            sent_at: Utc::now(),
            is_local: true,
        };
        self.signaling
            .send_chat(
                &room_id,
                &message.id,
                &message.sender_id,
                &message.text,
                message.sent_at,
            )
            .await?;

        debug!(
            target: "mesh.session.coordinator",
            message_id = %message.id,
            text_len = message.text.len(),
            "Chat message sent"
        );
        self.chat.push(message.clone());
        Ok(message)
    }

    fn in_room(&self) -> bool {
        matches!(self.state, CallState::Joining { .. } | CallState::InCall)
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::RosterSnapshot(roster) => {
                if !self.take_join_reply() || !self.in_room() {
                    return;
                }
                let summary = self.peers.reconcile(&roster);
                for peer_id in summary.removed {
                    self.notify(SessionNotice::PeerLeft(peer_id));
                }
                if let CallState::Joining {
                    roster_received, ..
                } = &mut self.state
                {
                    *roster_received = true;
                    if let Some(pending) = self.pending_join.as_mut() {
                        pending.roster_size =
                            roster.iter().filter(|p| **p != self.local_id).count();
                    }
                    self.try_complete_join();
                }
            }

            SignalingEvent::PeerJoined(peer_id) => {
                if self.in_room() {
                    self.peers.ensure_link(&peer_id);
                }
            }

            SignalingEvent::PeerLeft(peer_id) => {
                if let Some(closed) = self.peers.close_link(&peer_id) {
                    info!(
                        target: "mesh.session.coordinator",
                        peer_id = %peer_id,
                        was_connected = closed.was_connected,
                        "Peer left"
                    );
                    self.notify(SessionNotice::PeerLeft(peer_id));
                }
            }

            SignalingEvent::ChatReceived(chat) => {
                if !self.in_room() || chat.sender_id == self.local_id {
                    return;
                }
                self.chat.push(ChatMessage {
                    id: chat.id,
                    text: chat.text,
                    sender_id: chat.sender_id,
                    sent_at: chat.sent_at,
                    is_local: false,
                });
            }

            SignalingEvent::JoinRejected(rejection) => {
                if !self.take_join_reply() {
                    return;
                }
                if !matches!(self.state, CallState::Joining { .. }) {
                    debug!(
                        target: "mesh.session.coordinator",
                        reason = %rejection.reason,
                        "Join rejection outside a join ignored"
                    );
                    return;
                }
                let error = if rejection.is_room_full() {
                    SessionError::RoomFull
                } else {
                    SessionError::SignalingRejected(rejection.reason)
                };
                self.fail_join(error).await;
            }

            SignalingEvent::Negotiation {
                from,
                negotiation_id,
                payload,
            } => {
                if !self.in_room() || from == self.local_id {
                    return;
                }
                match payload {
                    NegotiationPayload::Offer { sdp } => {
                        let outcome = self.peers.accept_inbound(&from, negotiation_id, sdp);
                        if outcome == InboundOutcome::Ignored {
                            debug!(
                                target: "mesh.session.coordinator",
                                peer_id = %from,
                                "Inbound offer ignored"
                            );
                        }
                    }
                    NegotiationPayload::Answer { sdp } => {
                        self.peers.route_answer(&from, negotiation_id, sdp).await;
                    }
                    NegotiationPayload::Candidate(candidate) => {
                        self.peers
                            .route_candidate(&from, negotiation_id, candidate)
                            .await;
                    }
                }
            }

            SignalingEvent::ConnectionLost => {
                self.signaling_status = SignalingStatus::Degraded;
                // Replies owed on the old connection never arrive.
                self.stale_join_replies = 0;
                if self.in_room() {
                    self.grace_deadline =
                        Some(Instant::now() + self.config.signaling_grace_period());
                    warn!(
                        target: "mesh.session.coordinator",
                        links = self.peers.link_count(),
                        grace_seconds = self.config.signaling_grace_period_seconds,
                        "Signaling degraded, keeping peer links"
                    );
                    self.notify(SessionNotice::SignalingDegraded);
                }
            }

            SignalingEvent::ConnectionRestored => {
                self.signaling_status = SignalingStatus::Connected;
                if self.in_room() {
                    // The supervisor replayed our join on the new connection.
                    self.join_reply_outstanding = true;
                }
                if self.grace_deadline.take().is_some() {
                    info!(target: "mesh.session.coordinator", "Signaling restored");
                    self.notify(SessionNotice::SignalingRestored);
                }
            }

            SignalingEvent::ReconnectFailed => {
                self.signaling_status = SignalingStatus::Disconnected;
                self.end_for_signaling_loss().await;
            }
        }
    }

    /// Account for a `current-users` or `join-error` frame.
    ///
    /// Returns false if it answers a join that was already abandoned.
    fn take_join_reply(&mut self) -> bool {
        if self.stale_join_replies > 0 {
            self.stale_join_replies -= 1;
            debug!(
                target: "mesh.session.coordinator",
                remaining = self.stale_join_replies,
                "Reply to abandoned join discarded"
            );
            return false;
        }
        self.join_reply_outstanding = false;
        true
    }

    async fn end_for_signaling_loss(&mut self) {
        match self.state {
            CallState::InCall => self.end_call(Some(SessionError::SignalingDisconnected)).await,
            CallState::Joining { .. } => self.fail_join(SessionError::SignalingDisconnected).await,
            CallState::Idle | CallState::Leaving => {}
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            peer_id,
            negotiation_id,
            kind,
        } = event;
        match kind {
            LinkEventKind::Signal(payload) => {
                if !self.peers.is_current(&peer_id, negotiation_id) {
                    debug!(
                        target: "mesh.session.coordinator",
                        peer_id = %peer_id,
                        kind = payload.kind(),
                        "Signal from discarded link dropped"
                    );
                    return;
                }
                if let Err(e) = self
                    .signaling
                    .send_signal(&peer_id, negotiation_id, payload)
                    .await
                {
                    debug!(
                        target: "mesh.session.coordinator",
                        peer_id = %peer_id,
                        error = %e,
                        "Signal not sent"
                    );
                }
            }
            LinkEventKind::Connected(stream) => {
                self.peers.on_remote_stream(&peer_id, negotiation_id, stream);
            }
            LinkEventKind::Failed(error) => {
                if self.peers.on_link_failed(&peer_id, negotiation_id, &error) {
                    let reason = SessionError::PeerLinkFailed(peer_id.clone()).user_message();
                    warn!(
                        target: "mesh.session.coordinator",
                        peer_id = %peer_id,
                        error = %error,
                        "Peer link removed after failure"
                    );
                    self.notify(SessionNotice::PeerLinkFailed { peer_id, reason });
                }
            }
        }
    }

    async fn check_deadlines(&mut self) {
        let now = Instant::now();

        let join_expired = self
            .pending_join
            .as_ref()
            .is_some_and(|pending| now >= pending.deadline);
        if join_expired && matches!(self.state, CallState::Joining { .. }) {
            self.fail_join(SessionError::JoinTimedOut).await;
            return;
        }

        if self.grace_deadline.is_some_and(|deadline| now >= deadline) {
            self.grace_deadline = None;
            self.signaling_status = SignalingStatus::Disconnected;
            warn!(
                target: "mesh.session.coordinator",
                "Signaling grace period expired"
            );
            self.end_for_signaling_loss().await;
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&mut self) {
        let snapshot = self.build_snapshot();
        self.snapshot_tx.send_replace(snapshot);
    }

    fn build_snapshot(&self) -> CallSnapshot {
        let local_state = match self.state {
            CallState::InCall => ConnectionState::Connected,
            CallState::Joining { .. } => ConnectionState::Connecting,
            CallState::Idle | CallState::Leaving => ConnectionState::AwaitingConnection,
        };
        let mut participants = vec![ParticipantSession {
            peer_id: self.local_id.clone(),
            display_role: DisplayRole::Organizer,
            connection_state: local_state,
            direction: None,
            stream: self.media.local_stream().cloned(),
            is_local: true,
        }];
        participants.extend(self.peers.sessions());

        CallSnapshot {
            state: self.state,
            room_id: self.room_id.clone(),
            local_peer_id: self.local_id.clone(),
            participants,
            local_media: self.media.state(),
            chat: self.chat.clone(),
            signaling: self.signaling_status,
            last_join_failure: self.last_join_failure.clone(),
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            state = self.state.as_str(),
            links = self.peers.link_count(),
            "Performing graceful shutdown"
        );

        match self.state {
            CallState::InCall => self.end_call(None).await,
            CallState::Joining { .. } => self.fail_join(SessionError::JoinCancelled).await,
            CallState::Idle | CallState::Leaving => {}
        }
        self.signaling.disconnect().await;
        self.signaling_status = SignalingStatus::Disconnected;

        info!(
            target: "mesh.session.coordinator",
            local_id = %self.local_id,
            "Graceful shutdown complete"
        );
    }
}
