//! Session layer error types.
//!
//! `SessionError` is what callers of the session handle see. Every variant
//! carries a human-readable `user_message()` so a failed join is never
//! reported as a bare "failed". The narrower `MediaError`, `LinkError` and
//! `SignalingError` types are produced by the individual components and folded
//! into `SessionError` at the coordinator boundary.

use common::types::PeerId;
use thiserror::Error;

/// Session layer error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The user (or browser policy) refused camera/microphone access.
    #[error("Media permission denied")]
    MediaPermissionDenied,

    /// No capture device of the requested kind exists.
    #[error("Media device not found")]
    MediaDeviceNotFound,

    /// The platform has no media capture support.
    #[error("Media capture unsupported")]
    MediaUnsupported,

    /// No device can satisfy the requested constraints.
    #[error("Media constraints unsatisfiable")]
    MediaConstraintsUnsatisfiable,

    /// Media acquisition failed for an unclassified reason.
    #[error("Media error: {0}")]
    MediaUnknown(String),

    /// The relay refused the join intent.
    #[error("Signaling rejected: {0}")]
    SignalingRejected(String),

    /// The relay connection is gone and could not be restored.
    #[error("Signaling disconnected")]
    SignalingDisconnected,

    /// A single peer link failed. Always recovered locally.
    #[error("Peer link failed: {0}")]
    PeerLinkFailed(PeerId),

    /// The room is at capacity.
    #[error("Room is full")]
    RoomFull,

    /// Neither a roster nor a media completion arrived in time.
    #[error("Join timed out")]
    JoinTimedOut,

    /// The user left while the join was still in progress.
    #[error("Join cancelled")]
    JoinCancelled,

    /// Intent not valid in the current call state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Chat text was empty or whitespace only.
    #[error("Chat message is empty")]
    EmptyMessage,

    /// Internal error with context (actor channel failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SessionError::MediaPermissionDenied => "media_permission_denied",
            SessionError::MediaDeviceNotFound => "media_device_not_found",
            SessionError::MediaUnsupported => "media_unsupported",
            SessionError::MediaConstraintsUnsatisfiable => "media_constraints_unsatisfiable",
            SessionError::MediaUnknown(_) => "media_unknown",
            SessionError::SignalingRejected(_) => "signaling_rejected",
            SessionError::SignalingDisconnected => "signaling_disconnected",
            SessionError::PeerLinkFailed(_) => "peer_link_failed",
            SessionError::RoomFull => "room_full",
            SessionError::JoinTimedOut => "join_timed_out",
            SessionError::JoinCancelled => "join_cancelled",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::EmptyMessage => "empty_message",
            SessionError::Internal(_) => "internal",
        }
    }

    /// Returns a message suitable for showing to the user.
    ///
    /// Internal details are never included.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            SessionError::MediaPermissionDenied => {
                "Camera and microphone access was denied. Allow access in your browser settings and try again.".to_string()
            }
            SessionError::MediaDeviceNotFound => {
                "No camera or microphone was found. Connect a device and try again.".to_string()
            }
            SessionError::MediaUnsupported => {
                "Video calls are not supported on this device.".to_string()
            }
            SessionError::MediaConstraintsUnsatisfiable => {
                "Your camera or microphone does not support the requested settings.".to_string()
            }
            SessionError::MediaUnknown(_) => {
                "Could not start your camera or microphone.".to_string()
            }
            SessionError::SignalingRejected(reason) => {
                format!("The room refused the join request: {reason}")
            }
            SessionError::SignalingDisconnected => {
                "Lost connection to the call server.".to_string()
            }
            SessionError::PeerLinkFailed(_) => "A participant's connection dropped.".to_string(),
            SessionError::RoomFull => "This room is full.".to_string(),
            SessionError::JoinTimedOut => "Joining the room took too long. Try again.".to_string(),
            SessionError::JoinCancelled => "The join was cancelled.".to_string(),
            SessionError::InvalidState(_) => "That action is not available right now.".to_string(),
            SessionError::EmptyMessage => "Type a message before sending.".to_string(),
            SessionError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => SessionError::MediaPermissionDenied,
            MediaError::DeviceNotFound => SessionError::MediaDeviceNotFound,
            MediaError::DeviceUnsupported => SessionError::MediaUnsupported,
            MediaError::ConstraintsNotSatisfiable => SessionError::MediaConstraintsUnsatisfiable,
            MediaError::Unknown(detail) => SessionError::MediaUnknown(detail),
        }
    }
}

impl From<SignalingError> for SessionError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Connect(_) | SignalingError::Disconnected => {
                SessionError::SignalingDisconnected
            }
            SignalingError::InvalidUrl(detail) | SignalingError::Protocol(detail) => {
                SessionError::Internal(detail)
            }
        }
    }
}

/// Classified media acquisition failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// Access was refused.
    #[error("permission denied")]
    PermissionDenied,

    /// No matching capture device.
    #[error("device not found")]
    DeviceNotFound,

    /// Capture is not supported at all.
    #[error("device unsupported")]
    DeviceUnsupported,

    /// Devices exist but none satisfies the constraints.
    #[error("constraints not satisfiable")]
    ConstraintsNotSatisfiable,

    /// Anything else, with the device layer's message.
    #[error("unknown media error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Classify a failure reported by the device layer.
    ///
    /// `name` is the device API's error name (`NotAllowedError`,
    /// `NotFoundError`, ...). Unrecognised names become `Unknown` carrying
    /// `message`.
    #[must_use]
    pub fn classify(name: &str, message: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                MediaError::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" => MediaError::DeviceNotFound,
            "NotSupportedError" | "TypeError" => MediaError::DeviceUnsupported,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                MediaError::ConstraintsNotSatisfiable
            }
            _ => MediaError::Unknown(message.to_string()),
        }
    }

    /// Whether retrying with fewer requested tracks may succeed.
    #[must_use]
    pub fn is_relaxable(&self) -> bool {
        matches!(
            self,
            MediaError::PermissionDenied
                | MediaError::DeviceNotFound
                | MediaError::ConstraintsNotSatisfiable
        )
    }

    /// Returns a bounded label string for the error kind (for metrics).
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "permission_denied",
            MediaError::DeviceNotFound => "device_not_found",
            MediaError::DeviceUnsupported => "device_unsupported",
            MediaError::ConstraintsNotSatisfiable => "constraints_not_satisfiable",
            MediaError::Unknown(_) => "unknown",
        }
    }
}

/// Errors from a single peer link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// SDP offer/answer exchange failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The link did not connect within the negotiation timeout.
    #[error("negotiation timed out")]
    TimedOut,

    /// The link was closed.
    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// Returns a bounded label string for the failure reason (for metrics).
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            LinkError::Negotiation(_) => "negotiation",
            LinkError::Transport(_) => "transport",
            LinkError::TimedOut => "timeout",
            LinkError::Closed => "closed",
        }
    }
}

/// Errors from the relay connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// Opening the relay connection failed.
    #[error("relay connect failed: {0}")]
    Connect(String),

    /// No relay connection is currently established.
    #[error("relay disconnected")]
    Disconnected,

    /// The relay URL could not be parsed.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}
