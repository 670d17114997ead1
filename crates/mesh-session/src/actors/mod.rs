//! Actor model for the call session.
//!
//! ```text
//! SessionCoordinator (one per local participant)
//! ├── owns SignalingClient (relay reader task)
//! ├── owns MediaController (local capture lifecycle)
//! └── owns PeerConnectionManager
//!     └── LinkActor (one per remote peer)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: Every session mutation happens on the coordinator task
//! - **CancellationToken propagation**: Link actors get child tokens of the coordinator's
//! - **Negotiation ids**: Link events carry the id of the negotiation that produced them
//!   so results from a replaced link are dropped
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`coordinator`] - `SessionCoordinator` call state machine
//! - [`link`] - `LinkActor` per remote peer
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and session metrics

pub mod coordinator;
pub mod link;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use coordinator::{SessionCollaborators, SessionCoordinator, SessionHandle};
pub use link::{LinkActor, LinkActorHandle, LinkParams};
pub use messages::*;
pub use metrics::{ActorType, MailboxMonitor, SessionMetrics, SessionMetricsSnapshot};
