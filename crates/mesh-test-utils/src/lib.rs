//! # Mesh Test Utilities
//!
//! Shared test utilities for the mesh call session layer.
//!
//! This crate provides in-memory implementations of the session's external
//! seams so the coordinator can be driven end to end without a relay, a
//! camera or a media engine.
//!
//! ## Modules
//!
//! - `mock_relay` - Scriptable relay implementing `RelayConnector`
//! - `mock_media` - Device layer implementing `MediaDevices`
//! - `mock_transport` - Media engine implementing `PeerTransport`
//! - `fixtures` - `TestPeer` wiring plus wait helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let peer = TestPeer::new("alice")
//!         .with_relay(MockRelay::new().with_roster(&["bob"]))
//!         .spawn();
//!
//!     let joined = peer.handle.join("R1".into(), Default::default()).await.unwrap();
//!     assert_eq!(joined.roster_size, 1);
//!     assert_eq!(peer.transport.connects_to("bob"), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod mock_relay;
pub mod mock_transport;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_media::*;
pub use mock_relay::*;
pub use mock_transport::*;
