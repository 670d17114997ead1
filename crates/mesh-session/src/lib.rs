//! Mesh Call Session Library
//!
//! Client-side session layer for small-group video calls in a full-mesh
//! topology. Every participant holds one direct media link to every other
//! participant; a relay only forwards signaling frames between them.
//!
//! - Relay signaling with bounded reconnect and a grace period for live calls
//! - Local camera/microphone capture with degraded-media fallback
//! - One negotiated link per remote peer, with glare resolution
//! - A call state machine exposing snapshots and notices to the UI layer
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ──mpsc──▶ SessionCoordinator
//!                         ├── SignalingClient ◀──▶ relay (WebSocket)
//!                         ├── MediaController ◀──▶ MediaDevices
//!                         └── PeerConnectionManager
//!                             └── LinkActor × N ◀──▶ PeerTransport
//! ```
//!
//! The media engine and device access sit behind the [`peers::PeerTransport`]
//! and [`media::MediaDevices`] traits; the relay sits behind
//! [`signaling::RelayConnector`].
//!
//! # Modules
//!
//! - [`actors`] - Coordinator and link actors
//! - [`catalog`] - Room catalog types
//! - [`config`] - Session configuration from environment
//! - [`errors`] - Error types surfaced to callers
//! - [`media`] - Local media lifecycle
//! - [`observability`] - Tracing setup and metrics
//! - [`peers`] - Peer link registry
//! - [`recovery`] - Reconnect backoff
//! - [`signaling`] - Relay protocol and client

pub mod actors;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod peers;
pub mod recovery;
pub mod signaling;

pub use actors::{
    CallSnapshot, CallState, JoinOptions, JoinResult, SessionCollaborators, SessionCoordinator,
    SessionHandle, SessionNotice,
};
pub use config::SessionConfig;
pub use errors::{LinkError, MediaError, SessionError, SignalingError};
