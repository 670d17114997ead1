//! Relay signaling client.
//!
//! `SignalingClient` keeps one logical connection to the relay. Outbound
//! intents go through a bounded command channel to a supervisor task that owns
//! the live `RelayConnection`; inbound frames are decoded and forwarded to the
//! subscriber as `SignalingEvent`s.
//!
//! # Reconnection
//!
//! When the connection drops the supervisor emits `ConnectionLost`, retries
//! with bounded exponential backoff and, on success, replays the last join
//! intent (the relay answers with a fresh roster) before emitting
//! `ConnectionRestored`. If every attempt fails it emits `ReconnectFailed` and
//! exits. Sends made while disconnected fail with `Disconnected`.
//!
//! The client holds no call-domain state beyond that last join intent.

pub mod protocol;
pub mod websocket;

pub use protocol::{
    ClientFrame, IceCandidate, InboundChat, JoinErrorCode, JoinRejection, NegotiationId,
    NegotiationPayload, ServerFrame, SignalingEvent,
};
pub use websocket::WsRelayConnector;

use crate::errors::SignalingError;
use crate::observability;
use crate::recovery::{retry_with_backoff, RetryError, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MessageId, PeerId, RoomId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer for intents queued to the supervisor.
const COMMAND_CHANNEL_BUFFER: usize = 64;

/// Time allowed for the supervisor to exit on disconnect.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// An open relay connection as a pair of text-frame channels.
///
/// Dropping `outbound` closes the connection; `inbound` yielding `None` means
/// the relay went away.
#[derive(Debug)]
pub struct RelayConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens connections to the relay.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<RelayConnection, SignalingError>;
}

/// Client side of the relay protocol.
pub struct SignalingClient {
    connector: Arc<dyn RelayConnector>,
    retry: RetryPolicy,
    events: mpsc::Sender<SignalingEvent>,
    /// Parent token; each supervisor runs under a child of it.
    cancel_token: CancellationToken,
    session: Option<RelaySessionHandle>,
}

struct RelaySessionHandle {
    commands: mpsc::Sender<ClientFrame>,
    /// Owned by this supervisor, so a replaced one cannot flip it.
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Create a client that delivers inbound events to `events`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        retry: RetryPolicy,
        events: mpsc::Sender<SignalingEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            connector,
            retry,
            events,
            cancel_token,
            session: None,
        }
    }

    /// Open a relay connection without attaching it.
    ///
    /// The returned future does not borrow the client, so it can be awaited
    /// off the caller's loop and handed to `attach()` afterwards.
    pub fn dial(
        &self,
    ) -> impl Future<Output = Result<RelayConnection, SignalingError>> + Send + 'static {
        let connector = Arc::clone(&self.connector);
        async move { connector.connect().await }
    }

    /// Start supervising `connection`, replacing any previous one.
    pub fn attach(&mut self, connection: RelayConnection) {
        if let Some(previous) = self.session.take() {
            previous.cancel_token.cancel();
        }

        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let cancel_token = self.cancel_token.child_token();
        let connected = Arc::new(AtomicBool::new(true));

        let supervisor = RelaySupervisor {
            connector: Arc::clone(&self.connector),
            retry: self.retry.clone(),
            events: self.events.clone(),
            connected: Arc::clone(&connected),
            cancel_token: cancel_token.clone(),
            commands: receiver,
            last_join: None,
        };
        let task = tokio::spawn(supervisor.run(connection));

        info!(target: "mesh.session.signaling", "Relay connection attached");

        self.session = Some(RelaySessionHandle {
            commands,
            connected,
            cancel_token,
            task,
        });
    }

    /// Open and attach a relay connection. No-op if already connected.
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        if self.is_connected() {
            return Ok(());
        }
        let connection = self.dial().await?;
        self.attach(connection);
        Ok(())
    }

    /// Whether a relay connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst) && !s.task.is_finished())
    }

    /// Ask to join `room_id` as `local_id`. Remembered for replay on reconnect.
    pub async fn join_room(
        &self,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> Result<(), SignalingError> {
        self.send(ClientFrame::JoinRoom {
            room_id: room_id.clone(),
            user_id: local_id.clone(),
        })
        .await
    }

    /// Announce departure from `room_id`. Clears the remembered join.
    pub async fn leave_room(
        &self,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> Result<(), SignalingError> {
        self.send(ClientFrame::LeaveRoom {
            room_id: room_id.clone(),
            user_id: local_id.clone(),
        })
        .await
    }

    /// Broadcast a chat message to the room.
    pub async fn send_chat(
        &self,
        room_id: &RoomId,
        id: &MessageId,
        sender_id: &PeerId,
        text: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), SignalingError> {
        self.send(ClientFrame::SendMessage {
            room_id: room_id.clone(),
            id: id.clone(),
            sender_id: sender_id.clone(),
            text: text.to_string(),
            sent_at,
        })
        .await
    }

    /// Relay a negotiation message to one peer.
    pub async fn send_signal(
        &self,
        to: &PeerId,
        negotiation_id: NegotiationId,
        payload: NegotiationPayload,
    ) -> Result<(), SignalingError> {
        self.send(ClientFrame::Signal {
            to: to.clone(),
            negotiation_id,
            payload,
        })
        .await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), SignalingError> {
        let session = self.session.as_ref().ok_or(SignalingError::Disconnected)?;
        if !session.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::Disconnected);
        }
        session
            .commands
            .send(frame)
            .await
            .map_err(|_| SignalingError::Disconnected)
    }

    /// Close the relay connection and stop the supervisor.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.connected.store(false, Ordering::SeqCst);
        session.cancel_token.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, session.task).await {
            Ok(Ok(())) => {
                debug!(target: "mesh.session.signaling", "Relay supervisor stopped");
            }
            Ok(Err(e)) => {
                warn!(
                    target: "mesh.session.signaling",
                    error = ?e,
                    "Relay supervisor panicked during shutdown"
                );
            }
            Err(_) => {
                warn!(
                    target: "mesh.session.signaling",
                    "Relay supervisor shutdown timed out"
                );
            }
        }
    }
}

/// How a pump over one connection ended.
enum PumpExit {
    /// Stop requested or nobody is listening.
    Stopped,
    /// The relay connection dropped.
    ConnectionLost,
}

/// Task owning the live relay connection.
struct RelaySupervisor {
    connector: Arc<dyn RelayConnector>,
    retry: RetryPolicy,
    events: mpsc::Sender<SignalingEvent>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    commands: mpsc::Receiver<ClientFrame>,
    last_join: Option<ClientFrame>,
}

impl RelaySupervisor {
    #[instrument(skip_all, name = "mesh.signaling.supervisor")]
    async fn run(mut self, mut connection: RelayConnection) {
        loop {
            match self.pump(&mut connection).await {
                PumpExit::Stopped => break,
                PumpExit::ConnectionLost => {}
            }

            self.connected.store(false, Ordering::SeqCst);
            warn!(target: "mesh.session.signaling", "Relay connection lost");
            if self.events.send(SignalingEvent::ConnectionLost).await.is_err() {
                break;
            }

            match retry_with_backoff("relay_reconnect", &self.retry, &self.cancel_token, || {
                self.connector.connect()
            })
            .await
            {
                Ok(restored) => {
                    connection = restored;
                    if let Some(join) = &self.last_join {
                        // A failed replay surfaces as another loss on the next pump.
                        if let Ok(text) = join.to_text() {
                            let _ = connection.outbound.send(text).await;
                        }
                    }
                    self.connected.store(true, Ordering::SeqCst);
                    observability::record_signaling_reconnect("restored");
                    info!(
                        target: "mesh.session.signaling",
                        replayed_join = self.last_join.is_some(),
                        "Relay connection restored"
                    );
                    if self
                        .events
                        .send(SignalingEvent::ConnectionRestored)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted { attempts, last_error }) => {
                    observability::record_signaling_reconnect("failed");
                    warn!(
                        target: "mesh.session.signaling",
                        attempts = attempts,
                        error = %last_error,
                        "Relay reconnect failed"
                    );
                    let _ = self.events.send(SignalingEvent::ReconnectFailed).await;
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!(target: "mesh.session.signaling", "Relay supervisor exiting");
    }

    async fn pump(&mut self, connection: &mut RelayConnection) -> PumpExit {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return PumpExit::Stopped,

                command = self.commands.recv() => {
                    let Some(frame) = command else {
                        return PumpExit::Stopped;
                    };
                    match &frame {
                        ClientFrame::JoinRoom { .. } => self.last_join = Some(frame.clone()),
                        ClientFrame::LeaveRoom { .. } => self.last_join = None,
                        ClientFrame::SendMessage { .. } | ClientFrame::Signal { .. } => {}
                    }
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(
                                target: "mesh.session.signaling",
                                frame_type = frame.frame_type(),
                                error = %e,
                                "Failed to encode frame"
                            );
                            continue;
                        }
                    };
                    debug!(
                        target: "mesh.session.signaling",
                        frame_type = frame.frame_type(),
                        len = text.len(),
                        "Sending frame"
                    );
                    if connection.outbound.send(text).await.is_err() {
                        return PumpExit::ConnectionLost;
                    }
                }

                inbound = connection.inbound.recv() => {
                    let Some(text) = inbound else {
                        return PumpExit::ConnectionLost;
                    };
                    match ServerFrame::from_text(&text) {
                        Ok(frame) => {
                            if self.events.send(SignalingEvent::from(frame)).await.is_err() {
                                return PumpExit::Stopped;
                            }
                        }
                        Err(e) => {
                            warn!(
                                target: "mesh.session.signaling",
                                len = text.len(),
                                error = %e,
                                "Skipping malformed relay frame"
                            );
                        }
                    }
                }
            }
        }
    }
}
