//! Relay wire protocol.
//!
//! Frames are JSON text, internally tagged by `type` with kebab-case names
//! matching the relay's event names. Field names are camelCase.
//!
//! ```text
//! {"type":"join-room","roomId":"R1","userId":"alice"}
//! {"type":"current-users","users":["bob"]}
//! {"type":"signal","from":"bob","negotiationId":"…","payload":{"kind":"offer","sdp":"…"}}
//! ```

use crate::errors::SignalingError;

use chrono::{DateTime, Utc};
use common::types::{MessageId, PeerId, RoomId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one link attempt between two peers.
///
/// Fresh per attempt and carried on every negotiation signal so signals
/// belonging to a discarded attempt can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationId(Uuid);

impl NegotiationId {
    /// Create a new random negotiation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NegotiationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A remote or local ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Peer negotiation message relayed between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NegotiationPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl NegotiationPayload {
    /// Returns the payload kind as a string for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationPayload::Offer { .. } => "offer",
            NegotiationPayload::Answer { .. } => "answer",
            NegotiationPayload::Candidate(_) => "candidate",
        }
    }
}

/// Machine-readable join rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinErrorCode {
    RoomFull,
    RoomNotFound,
    Unauthorized,
    Other,
}

impl JoinErrorCode {
    /// Parse the relay's `code` field. Unknown codes map to `Other`.
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code {
            "room-full" => JoinErrorCode::RoomFull,
            "room-not-found" => JoinErrorCode::RoomNotFound,
            "unauthorized" => JoinErrorCode::Unauthorized,
            _ => JoinErrorCode::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinErrorCode::RoomFull => "room-full",
            JoinErrorCode::RoomNotFound => "room-not-found",
            JoinErrorCode::Unauthorized => "unauthorized",
            JoinErrorCode::Other => "other",
        }
    }
}

/// Frames sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId, user_id: PeerId },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId, user_id: PeerId },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        id: MessageId,
        sender_id: PeerId,
        text: String,
        sent_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Signal {
        to: PeerId,
        negotiation_id: NegotiationId,
        payload: NegotiationPayload,
    },
}

/// Frames received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    CurrentUsers { users: Vec<PeerId> },

    #[serde(rename_all = "camelCase")]
    UserConnected { user_id: PeerId },

    #[serde(rename_all = "camelCase")]
    UserDisconnected { user_id: PeerId },

    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        id: MessageId,
        sender_id: PeerId,
        text: String,
        sent_at: DateTime<Utc>,
    },

    JoinError {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Signal {
        from: PeerId,
        negotiation_id: NegotiationId,
        payload: NegotiationPayload,
    },
}

impl ClientFrame {
    /// Returns the frame type for logs.
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::JoinRoom { .. } => "join-room",
            ClientFrame::LeaveRoom { .. } => "leave-room",
            ClientFrame::SendMessage { .. } => "send-message",
            ClientFrame::Signal { .. } => "signal",
        }
    }

    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))
    }
}

impl ServerFrame {
    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))
    }
}

/// A chat message received from another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChat {
    pub id: MessageId,
    pub sender_id: PeerId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Why the relay refused a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRejection {
    pub reason: String,
    pub code: Option<JoinErrorCode>,
}

impl JoinRejection {
    #[must_use]
    pub fn is_room_full(&self) -> bool {
        self.code == Some(JoinErrorCode::RoomFull)
    }
}

/// Typed events delivered to the signaling subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    RosterSnapshot(Vec<PeerId>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    ChatReceived(InboundChat),
    JoinRejected(JoinRejection),
    Negotiation {
        from: PeerId,
        negotiation_id: NegotiationId,
        payload: NegotiationPayload,
    },
    ConnectionLost,
    ConnectionRestored,
    ReconnectFailed,
}

impl From<ServerFrame> for SignalingEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::CurrentUsers { users } => SignalingEvent::RosterSnapshot(users),
            ServerFrame::UserConnected { user_id } => SignalingEvent::PeerJoined(user_id),
            ServerFrame::UserDisconnected { user_id } => SignalingEvent::PeerLeft(user_id),
            ServerFrame::ReceiveMessage {
                id,
                sender_id,
                text,
                sent_at,
            } => SignalingEvent::ChatReceived(InboundChat {
                id,
                sender_id,
                text,
                sent_at,
            }),
            ServerFrame::JoinError { reason, code } => {
                SignalingEvent::JoinRejected(JoinRejection {
                    reason,
                    code: code.as_deref().map(JoinErrorCode::parse),
                })
            }
            ServerFrame::Signal {
                from,
                negotiation_id,
                payload,
            } => SignalingEvent::Negotiation {
                from,
                negotiation_id,
                payload,
            },
        }
    }
}
