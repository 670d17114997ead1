//! Metrics definitions for the session layer.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! The session layer only emits through the `metrics` facade; installing a
//! recorder/exporter is left to the embedding application. With no recorder
//! installed every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Set the number of live peer links.
///
/// Metric: `mesh_links_active`
/// Labels: none
pub fn set_links_active(count: usize) {
    // usize to f64 conversion is safe for realistic link counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_links_active").set(count as f64);
}

/// Record the time a link took to deliver a remote stream.
///
/// Metric: `mesh_link_negotiation_seconds`
/// Labels: none
pub fn record_link_negotiation(duration: Duration) {
    histogram!("mesh_link_negotiation_seconds").record(duration.as_secs_f64());
}

/// Record a link torn down by an error.
///
/// Metric: `mesh_link_failures_total`
/// Labels: `reason` (negotiation, transport, timeout, closed)
pub fn record_link_failure(reason: &'static str) {
    counter!("mesh_link_failures_total", "reason" => reason).increment(1);
}

/// Record a local media request outcome.
///
/// Metric: `mesh_media_acquire_total`
/// Labels: `outcome` (success or a media error kind)
pub fn record_media_acquire(outcome: &'static str) {
    counter!("mesh_media_acquire_total", "outcome" => outcome).increment(1);
}

/// Record the end of a relay reconnect cycle.
///
/// Metric: `mesh_signaling_reconnects_total`
/// Labels: `outcome` (restored, failed)
pub fn record_signaling_reconnect(outcome: &'static str) {
    counter!("mesh_signaling_reconnects_total", "outcome" => outcome).increment(1);
}

/// Record a join attempt outcome.
///
/// Metric: `mesh_join_total`
/// Labels: `outcome` (success or a session error label)
pub fn record_join(outcome: &'static str) {
    counter!("mesh_join_total", "outcome" => outcome).increment(1);
}
