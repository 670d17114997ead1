//! Scriptable relay for session testing.
//!
//! `MockRelay` implements `RelayConnector` over in-memory channels. It records
//! every frame the client sends, answers `join-room` with a roster (or a
//! scripted rejection), and lets a test push server frames or drop the live
//! connection to exercise reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockRelay;
//!
//! let relay = MockRelay::new().with_roster(&["bob"]);
//!
//! // ... join through a session using `relay.connector()` ...
//!
//! relay.peer_joined("carol").await?;
//! let offer = relay.wait_for_offer_to("carol").await?;
//! ```

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use common::types::{MessageId, PeerId};
use mesh_session::errors::SignalingError;
use mesh_session::signaling::{
    ClientFrame, NegotiationId, NegotiationPayload, RelayConnection, RelayConnector, ServerFrame,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Buffer for each direction of a mock connection.
const MOCK_CHANNEL_BUFFER: usize = 64;

/// How long the `wait_for_*` helpers wait before failing.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mock relay for testing the signaling client and coordinator.
#[derive(Debug, Clone)]
pub struct MockRelay {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<RelayState>,
    frame_sent: Notify,
}

#[derive(Debug)]
struct RelayState {
    /// Users reported in `current-users` (the joining user is filtered out).
    roster: Vec<PeerId>,
    /// Rejection sent instead of a roster: (reason, code).
    join_error: Option<(String, Option<String>)>,
    answer_joins: bool,
    refuse_connections: bool,
    connect_attempts: usize,
    connections: usize,
    frames: Vec<ClientFrame>,
    live: Option<LiveConnection>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            roster: Vec::new(),
            join_error: None,
            answer_joins: true,
            refuse_connections: false,
            connect_attempts: 0,
            connections: 0,
            frames: Vec::new(),
            live: None,
        }
    }
}

#[derive(Debug)]
struct LiveConnection {
    to_client: mpsc::Sender<String>,
    stop: CancellationToken,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    /// Create a relay with an empty room that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Users already in the room when someone joins.
    #[must_use]
    pub fn with_roster(self, users: &[&str]) -> Self {
        self.set_roster(users);
        self
    }

    /// Reject joins with `reason` and an optional machine code.
    #[must_use]
    pub fn with_join_error(self, reason: &str, code: Option<&str>) -> Self {
        self.state().join_error = Some((reason.to_string(), code.map(str::to_string)));
        self
    }

    /// Record joins but never answer them.
    #[must_use]
    pub fn without_join_reply(self) -> Self {
        self.state().answer_joins = false;
        self
    }

    /// Refuse every connection attempt.
    #[must_use]
    pub fn with_refused_connections(self) -> Self {
        self.set_refuse_connections(true);
        self
    }

    /// The connector to hand to a session.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn RelayConnector> {
        Arc::new(self.clone())
    }

    pub fn set_roster(&self, users: &[&str]) {
        self.state().roster = users.iter().map(|u| PeerId::from(*u)).collect();
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Number of `connect()` calls, refused ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Number of connections handed out.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state().connections
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state()
            .live
            .as_ref()
            .is_some_and(|live| !live.to_client.is_closed())
    }

    /// Every frame received from the client, in order.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.state().frames.clone()
    }

    /// Number of received frames matching `predicate`.
    pub fn count_frames<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ClientFrame) -> bool,
    {
        self.state().frames.iter().filter(|f| predicate(f)).count()
    }

    /// Negotiation payloads the client addressed to `peer`.
    #[must_use]
    pub fn signals_to(&self, peer: &str) -> Vec<(NegotiationId, NegotiationPayload)> {
        self.state()
            .frames
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Signal {
                    to,
                    negotiation_id,
                    payload,
                } if to.as_str() == peer => Some((*negotiation_id, payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Deliver a frame to the client over the live connection.
    pub async fn push(&self, frame: ServerFrame) -> anyhow::Result<()> {
        let to_client = self
            .state()
            .live
            .as_ref()
            .map(|live| live.to_client.clone())
            .ok_or_else(|| anyhow!("no live relay connection"))?;
        let text = frame.to_text()?;
        to_client
            .send(text)
            .await
            .map_err(|_| anyhow!("client connection closed"))
    }

    pub async fn peer_joined(&self, peer: &str) -> anyhow::Result<()> {
        self.push(ServerFrame::UserConnected {
            user_id: PeerId::from(peer),
        })
        .await
    }

    pub async fn peer_left(&self, peer: &str) -> anyhow::Result<()> {
        self.push(ServerFrame::UserDisconnected {
            user_id: PeerId::from(peer),
        })
        .await
    }

    pub async fn roster(&self, users: &[&str]) -> anyhow::Result<()> {
        self.push(ServerFrame::CurrentUsers {
            users: users.iter().map(|u| PeerId::from(*u)).collect(),
        })
        .await
    }

    pub async fn chat_from(&self, sender: &str, text: &str) -> anyhow::Result<()> {
        self.push(ServerFrame::ReceiveMessage {
            id: MessageId::generate(),
            sender_id: PeerId::from(sender),
            text: text.to_string(),
            sent_at: Utc::now(),
        })
        .await
    }

    /// Relay a negotiation payload from `from` to the client.
    pub async fn signal_from(
        &self,
        from: &str,
        negotiation_id: NegotiationId,
        payload: NegotiationPayload,
    ) -> anyhow::Result<()> {
        self.push(ServerFrame::Signal {
            from: PeerId::from(from),
            negotiation_id,
            payload,
        })
        .await
    }

    /// Drop the live connection as if the network went away.
    pub fn drop_connection(&self) {
        if let Some(live) = self.state().live.take() {
            live.stop.cancel();
        }
    }

    /// Wait until at least `count` frames match `predicate`; returns them.
    pub async fn wait_for_frames<F>(
        &self,
        count: usize,
        predicate: F,
    ) -> anyhow::Result<Vec<ClientFrame>>
    where
        F: Fn(&ClientFrame) -> bool,
    {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.shared.frame_sent.notified();
                let matching: Vec<ClientFrame> = self
                    .state()
                    .frames
                    .iter()
                    .filter(|f| predicate(f))
                    .cloned()
                    .collect();
                if matching.len() >= count {
                    return matching;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for {count} matching client frames"))
    }

    /// Wait for the first frame matching `predicate`.
    pub async fn wait_for_frame<F>(&self, predicate: F) -> anyhow::Result<ClientFrame>
    where
        F: Fn(&ClientFrame) -> bool,
    {
        let frames = self.wait_for_frames(1, predicate).await?;
        frames
            .into_iter()
            .next()
            .context("frame list unexpectedly empty")
    }

    /// Wait for the client's offer to `peer`; returns its negotiation id and SDP.
    pub async fn wait_for_offer_to(&self, peer: &str) -> anyhow::Result<(NegotiationId, String)> {
        let frame = self
            .wait_for_frame(|f| {
                matches!(
                    f,
                    ClientFrame::Signal { to, payload: NegotiationPayload::Offer { .. }, .. }
                        if to.as_str() == peer
                )
            })
            .await?;
        match frame {
            ClientFrame::Signal {
                negotiation_id,
                payload: NegotiationPayload::Offer { sdp },
                ..
            } => Ok((negotiation_id, sdp)),
            other => Err(anyhow!("unexpected frame {other:?}")),
        }
    }

    /// Wait for the client's answer to `peer`; returns its negotiation id.
    pub async fn wait_for_answer_to(&self, peer: &str) -> anyhow::Result<NegotiationId> {
        let frame = self
            .wait_for_frame(|f| {
                matches!(
                    f,
                    ClientFrame::Signal { to, payload: NegotiationPayload::Answer { .. }, .. }
                        if to.as_str() == peer
                )
            })
            .await?;
        match frame {
            ClientFrame::Signal { negotiation_id, .. } => Ok(negotiation_id),
            other => Err(anyhow!("unexpected frame {other:?}")),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.shared.state.lock().unwrap()
    }

    /// Record a client frame and produce the relay's automatic reply.
    fn on_client_text(&self, text: &str) -> Option<ServerFrame> {
        let frame = ClientFrame::from_text(text).ok()?;
        let reply = {
            let mut state = self.state();
            state.frames.push(frame.clone());
            match &frame {
                ClientFrame::JoinRoom { user_id, .. } if state.answer_joins => {
                    Some(match &state.join_error {
                        Some((reason, code)) => ServerFrame::JoinError {
                            reason: reason.clone(),
                            code: code.clone(),
                        },
                        None => ServerFrame::CurrentUsers {
                            users: state
                                .roster
                                .iter()
                                .filter(|u| *u != user_id)
                                .cloned()
                                .collect(),
                        },
                    })
                }
                _ => None,
            }
        };
        self.shared.frame_sent.notify_waiters();
        reply
    }
}

#[async_trait]
impl RelayConnector for MockRelay {
    async fn connect(&self) -> Result<RelayConnection, SignalingError> {
        let (outbound, mut from_client) = mpsc::channel::<String>(MOCK_CHANNEL_BUFFER);
        let (to_client, inbound) = mpsc::channel::<String>(MOCK_CHANNEL_BUFFER);
        let stop = CancellationToken::new();

        {
            let mut state = self.state();
            state.connect_attempts += 1;
            if state.refuse_connections {
                return Err(SignalingError::Connect("mock relay refused".to_string()));
            }
            state.connections += 1;
            let previous = state.live.replace(LiveConnection {
                to_client: to_client.clone(),
                stop: stop.clone(),
            });
            if let Some(previous) = previous {
                previous.stop.cancel();
            }
        }

        let relay = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    text = from_client.recv() => {
                        let Some(text) = text else { break };
                        if let Some(reply) = relay.on_client_text(&text) {
                            let Ok(reply) = reply.to_text() else { continue };
                            if to_client.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(RelayConnection { outbound, inbound })
    }
}
