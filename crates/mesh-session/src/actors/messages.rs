//! Message types for actor communication.
//!
//! Intents from the presentation layer reach the coordinator as request/reply
//! messages over `tokio::sync::mpsc` with a `tokio::sync::oneshot` reply.
//! Link actors report upward with [`LinkEvent`].

use crate::errors::{LinkError, SessionError};
use crate::media::{LocalMediaState, MediaConstraints, MediaStream, MediaTrack};
use crate::signaling::protocol::{IceCandidate, NegotiationId, NegotiationPayload};

use chrono::{DateTime, Utc};
use common::types::{MessageId, PeerId, RoomId};
use tokio::sync::oneshot;

/// Messages sent to the `SessionCoordinator`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Join a room. Resolves once the call is in progress or the attempt fails.
    Join {
        room_id: RoomId,
        options: JoinOptions,
        respond_to: oneshot::Sender<Result<JoinResult, SessionError>>,
    },

    /// Leave the current call, or cancel a join in progress.
    Leave {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Toggle the camera track.
    SetVideoEnabled {
        enabled: bool,
        /// False when no video track exists.
        respond_to: oneshot::Sender<bool>,
    },

    /// Toggle the microphone track.
    SetAudioEnabled {
        enabled: bool,
        /// False when no audio track exists.
        respond_to: oneshot::Sender<bool>,
    },

    /// Replace the outgoing video with a display capture.
    StartScreenShare {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Revert the outgoing video to the camera track.
    StopScreenShare {
        /// False when no screen share was active.
        respond_to: oneshot::Sender<bool>,
    },

    /// Send a chat message to the room.
    SendChat {
        text: String,
        respond_to: oneshot::Sender<Result<ChatMessage, SessionError>>,
    },

    /// Get the current call snapshot.
    GetSnapshot {
        respond_to: oneshot::Sender<CallSnapshot>,
    },

    /// End any active call, close signaling and stop the actor.
    Dispose { respond_to: oneshot::Sender<()> },
}

/// Options for a join attempt.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Media to request. Relaxed on failure when degraded media is allowed.
    pub constraints: MediaConstraints,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    pub room_id: RoomId,
    /// Remote peers in the roster snapshot that completed the join.
    pub roster_size: usize,
    /// True when the acquired media is less than what was requested.
    pub degraded_media: bool,
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Media acquisition and the signaling join race independently.
    Joining {
        media_ready: bool,
        roster_received: bool,
    },
    InCall,
    Leaving,
}

impl CallState {
    /// Returns the state tag for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Joining { .. } => "joining",
            CallState::InCall => "in_call",
            CallState::Leaving => "leaving",
        }
    }
}

/// Cosmetic role shown next to a participant. Derived locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRole {
    Organizer,
    Presenter,
    CoOrganizer,
    Attendee,
}

impl DisplayRole {
    /// Role for the remote participant with the given arrival index.
    #[must_use]
    pub const fn for_arrival(index: u64) -> Self {
        match index % 3 {
            0 => DisplayRole::Presenter,
            1 => DisplayRole::CoOrganizer,
            _ => DisplayRole::Attendee,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DisplayRole::Organizer => "Organizer",
            DisplayRole::Presenter => "Presenter",
            DisplayRole::CoOrganizer => "Co-organizer",
            DisplayRole::Attendee => "Attendee",
        }
    }
}

/// Media connection state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Known from signaling, link not started (local media not ready yet).
    AwaitingConnection,
    Connecting,
    Connected,
    Closed,
}

/// Which side started the negotiation of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Outbound,
    Inbound,
}

impl LinkDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkDirection::Outbound => "outbound",
            LinkDirection::Inbound => "inbound",
        }
    }
}

/// One participant as seen by the presentation layer.
#[derive(Debug, Clone)]
pub struct ParticipantSession {
    pub peer_id: PeerId,
    pub display_role: DisplayRole,
    pub connection_state: ConnectionState,
    /// `None` for the local participant and for peers awaiting a link.
    pub direction: Option<LinkDirection>,
    /// Present only while `Connected`.
    pub stream: Option<MediaStream>,
    pub is_local: bool,
}

/// One entry in the in-call transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub text: String,
    pub sender_id: PeerId,
    pub sent_at: DateTime<Utc>,
    pub is_local: bool,
}

/// Relay connection health as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStatus {
    Connected,
    /// Connection lost; links are kept while reconnecting.
    Degraded,
    Disconnected,
}

/// The read model for the presentation layer.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    pub room_id: Option<RoomId>,
    pub local_peer_id: PeerId,
    /// Local participant first, then remote peers by arrival.
    pub participants: Vec<ParticipantSession>,
    pub local_media: LocalMediaState,
    pub chat: Vec<ChatMessage>,
    pub signaling: SignalingStatus,
    pub last_join_failure: Option<SessionError>,
}

impl CallSnapshot {
    /// Remote participants only.
    pub fn remote_participants(&self) -> impl Iterator<Item = &ParticipantSession> {
        self.participants.iter().filter(|p| !p.is_local)
    }

    /// Look up a participant by id.
    #[must_use]
    pub fn participant(&self, peer_id: &PeerId) -> Option<&ParticipantSession> {
        self.participants.iter().find(|p| &p.peer_id == peer_id)
    }
}

/// Informational notices broadcast by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// A peer link failed and was removed. The call continues.
    PeerLinkFailed { peer_id: PeerId, reason: String },
    /// A peer left the room.
    PeerLeft(PeerId),
    /// Relay connection lost; reconnecting.
    SignalingDegraded,
    /// Relay connection restored.
    SignalingRestored,
    /// The display capture ended and the camera was restored.
    ScreenShareEnded,
    /// The call ended. `cause` is `None` for a user-initiated leave.
    CallEnded { cause: Option<SessionError> },
}

/// Messages sent to a `LinkActor`.
#[derive(Debug)]
pub enum LinkMessage {
    /// The remote answer to our offer.
    RemoteAnswer { sdp: String },

    /// A trickled remote ICE candidate.
    RemoteCandidate { candidate: IceCandidate },

    /// Swap the outgoing video source.
    ReplaceVideo { track: Option<MediaTrack> },
}

/// Event reported by a link actor to the coordinator.
#[derive(Debug)]
pub struct LinkEvent {
    pub peer_id: PeerId,
    pub negotiation_id: NegotiationId,
    pub kind: LinkEventKind,
}

#[derive(Debug)]
pub enum LinkEventKind {
    /// Negotiation payload to relay to the remote peer.
    Signal(NegotiationPayload),
    /// Remote media arrived; the link is up.
    Connected(MediaStream),
    /// The link failed and its actor has exited.
    Failed(LinkError),
}
