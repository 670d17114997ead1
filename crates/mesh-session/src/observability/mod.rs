//! Observability for the session layer.
//!
//! # Privacy by Default
//!
//! Chat text and SDP bodies are never logged or used as labels; only their
//! lengths are recorded. Metric labels are bounded:
//! - `reason`: link failure reasons (negotiation, transport, timeout, closed)
//! - `outcome`: bounded by code (success, fallback, or a media error kind)
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_links_active` | Gauge | none | Current peer links |
//! | `mesh_link_negotiation_seconds` | Histogram | none | Time from link creation to remote stream |
//! | `mesh_link_failures_total` | Counter | `reason` | Links torn down by errors |
//! | `mesh_media_acquire_total` | Counter | `outcome` | Local media requests |
//! | `mesh_signaling_reconnects_total` | Counter | `outcome` | Relay reconnect cycles |
//! | `mesh_join_total` | Counter | `outcome` | Join attempts |

pub mod metrics;

use thiserror::Error;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

// Re-exports for convenience
pub use metrics::{
    record_join, record_link_failure, record_link_negotiation, record_media_acquire,
    record_signaling_reconnect, set_links_active,
};

#[derive(Debug, Error)]
pub enum TracingInitError {
    /// Another global subscriber was installed first.
    #[error("failed to install tracing subscriber: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Install a global tracing subscriber for embedding applications.
///
/// Honours `RUST_LOG`; defaults to `mesh_session=info`. `json` switches the
/// formatter to JSON lines. Returns an error if a subscriber is already set.
pub fn init_tracing(json: bool) -> Result<(), TracingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mesh_session=info,mesh.session=info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(TracingInitError::from)
}
