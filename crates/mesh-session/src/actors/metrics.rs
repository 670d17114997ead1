//! Actor metrics and mailbox monitoring.
//!
//! Each actor samples its own receiver after taking a message off it, so the
//! recorded depth is the backlog still waiting behind that message.
//!
//! | Actor       | Elevated at | Critical at |
//! |-------------|-------------|-------------|
//! | Coordinator | 64          | 256         |
//! | Link        | 16          | 64          |

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Coordinator backlog thresholds.
pub const COORDINATOR_BACKLOG_ELEVATED: usize = 64;
pub const COORDINATOR_BACKLOG_CRITICAL: usize = 256;

/// Link actor backlog thresholds.
pub const LINK_BACKLOG_ELEVATED: usize = 16;
pub const LINK_BACKLOG_CRITICAL: usize = 64;

/// Kind of actor being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Coordinator,
    Link,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Coordinator => "coordinator",
            ActorType::Link => "link",
        }
    }

    /// Backlog at which the mailbox counts as elevated and critical.
    #[must_use]
    pub const fn thresholds(&self) -> (usize, usize) {
        match self {
            ActorType::Coordinator => (COORDINATOR_BACKLOG_ELEVATED, COORDINATOR_BACKLOG_CRITICAL),
            ActorType::Link => (LINK_BACKLOG_ELEVATED, LINK_BACKLOG_CRITICAL),
        }
    }

    #[must_use]
    pub const fn level(&self, backlog: usize) -> MailboxLevel {
        let (elevated, critical) = self.thresholds();
        if backlog >= critical {
            MailboxLevel::Critical
        } else if backlog >= elevated {
            MailboxLevel::Elevated
        } else {
            MailboxLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxLevel {
    Normal,
    Elevated,
    Critical,
}

/// Backlog monitor owned by a single actor.
///
/// Logs only when the level changes, so a mailbox that stays busy produces
/// one line rather than one per message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Local peer id for the coordinator, remote peer id for a link.
    actor_id: String,
    level: MailboxLevel,
    peak_backlog: usize,
    messages_processed: u64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            level: MailboxLevel::Normal,
            peak_backlog: 0,
            messages_processed: 0,
        }
    }

    /// Record one dequeued message and the backlog left behind it.
    pub fn observe(&mut self, backlog: usize) {
        self.messages_processed += 1;
        self.peak_backlog = self.peak_backlog.max(backlog);

        let level = self.actor_type.level(backlog);
        if level == self.level {
            return;
        }
        let previous = std::mem::replace(&mut self.level, level);
        match level {
            MailboxLevel::Critical => warn!(
                target: "mesh.session.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                "Mailbox backlog critical"
            ),
            MailboxLevel::Elevated if previous == MailboxLevel::Normal => debug!(
                target: "mesh.session.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                "Mailbox backlog elevated"
            ),
            MailboxLevel::Elevated | MailboxLevel::Normal => debug!(
                target: "mesh.session.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                backlog = backlog,
                "Mailbox backlog easing"
            ),
        }
    }

    #[must_use]
    pub fn level(&self) -> MailboxLevel {
        self.level
    }

    #[must_use]
    pub fn peak_backlog(&self) -> usize {
        self.peak_backlog
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }
}

/// Counters for one session, shared by the coordinator, the peer manager,
/// the media controller and the handle.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    links_created: AtomicU64,
    links_closed: AtomicU64,
    links_active: AtomicUsize,
    link_failures: AtomicU64,
    media_requests: AtomicU64,
    media_releases: AtomicU64,
    messages_processed: AtomicU64,
}

/// Point-in-time copy of `SessionMetrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetricsSnapshot {
    pub links_created: u64,
    pub links_closed: u64,
    pub links_active: usize,
    pub link_failures: u64,
    pub media_requests: u64,
    pub media_releases: u64,
    pub messages_processed: u64,
}

impl SessionMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A link actor was spawned.
    pub fn link_created(&self) {
        self.links_created.fetch_add(1, Ordering::Relaxed);
        let active = self.links_active.fetch_add(1, Ordering::Relaxed) + 1;
        crate::observability::set_links_active(active);
    }

    /// A link was torn down, for any reason. Never drops below zero.
    pub fn link_closed(&self) {
        self.links_closed.fetch_add(1, Ordering::Relaxed);
        let before = self
            .links_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        crate::observability::set_links_active(before.saturating_sub(1));
    }

    pub fn record_link_failure(&self, reason: &'static str) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
        crate::observability::record_link_failure(reason);
    }

    /// Camera/microphone asked of the device layer, fallbacks included.
    pub fn record_media_request(&self) {
        self.media_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_media_release(&self) {
        self.media_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// An intent was handled by the coordinator.
    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links_active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            links_created: self.links_created.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
            links_active: self.links_active.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            media_requests: self.media_requests.load(Ordering::Relaxed),
            media_releases: self.media_releases.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
        }
    }
}
