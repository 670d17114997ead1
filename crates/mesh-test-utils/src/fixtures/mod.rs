//! Pre-configured fixtures for session testing.
//!
//! Provides:
//! - `TestPeer`: a builder wiring a `SessionCoordinator` to the mocks
//! - `RunningPeer`: the spawned coordinator plus handles on its mocks
//! - Helpers that wait on published snapshots and notices

use crate::mock_media::MockMediaDevices;
use crate::mock_relay::{MockRelay, WAIT_TIMEOUT};
use crate::mock_transport::MockPeerTransport;

use anyhow::anyhow;
use common::types::{PeerId, RoomId};
use mesh_session::actors::{
    CallSnapshot, CallState, JoinOptions, JoinResult, SessionCollaborators, SessionCoordinator,
    SessionHandle, SessionNotice,
};
use mesh_session::config::SessionConfig;
use mesh_session::errors::SessionError;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber once per test binary.
///
/// Honours `RUST_LOG`; silent by default.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Session configuration for tests.
#[must_use]
pub fn test_config() -> SessionConfig {
    SessionConfig::with_relay_url("ws://relay.test/socket")
}

/// Poll `condition` until it holds.
///
/// For effects that land on another task with no snapshot to watch, such as
/// a link task closing its connection after being cancelled.
pub async fn wait_until<F>(condition: F) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("condition not met within {WAIT_TIMEOUT:?}"))
}

/// Builder for a session participant backed by mocks.
#[derive(Debug, Clone)]
pub struct TestPeer {
    pub id: PeerId,
    pub config: SessionConfig,
    pub relay: MockRelay,
    pub devices: MockMediaDevices,
    pub transport: MockPeerTransport,
}

impl TestPeer {
    /// Create a participant with fresh mocks and default configuration.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: PeerId::from(id),
            config: test_config(),
            relay: MockRelay::new(),
            devices: MockMediaDevices::new(),
            transport: MockPeerTransport::new(),
        }
    }

    /// Create a participant with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(&format!("peer-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn with_relay(mut self, relay: MockRelay) -> Self {
        self.relay = relay;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, devices: MockMediaDevices) -> Self {
        self.devices = devices;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: MockPeerTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Adjust the configuration in place.
    #[must_use]
    pub fn with_config(mut self, adjust: impl FnOnce(&mut SessionConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    /// Refuse degraded media so the first media failure ends the join.
    #[must_use]
    pub fn without_degraded_media(self) -> Self {
        self.with_config(|c| c.allow_degraded_media = false)
    }

    /// Spawn the coordinator. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(self) -> RunningPeer {
        init_test_tracing();
        let collaborators = SessionCollaborators {
            relay: self.relay.connector(),
            devices: self.devices.as_devices(),
            transport: self.transport.as_transport(),
        };
        let cancel_token = CancellationToken::new();
        let (handle, task) = SessionCoordinator::spawn(
            self.config,
            self.id,
            collaborators,
            cancel_token.clone(),
        );
        let notices = handle.subscribe();
        RunningPeer {
            handle,
            task,
            cancel_token,
            notices,
            relay: self.relay,
            devices: self.devices,
            transport: self.transport,
        }
    }
}

/// A spawned coordinator and its mocks.
pub struct RunningPeer {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub cancel_token: CancellationToken,
    /// Subscribed before the actor processed anything.
    pub notices: broadcast::Receiver<SessionNotice>,
    pub relay: MockRelay,
    pub devices: MockMediaDevices,
    pub transport: MockPeerTransport,
}

impl RunningPeer {
    /// Join `room` with default options.
    pub async fn join(&self, room: &str) -> Result<JoinResult, SessionError> {
        self.handle
            .join(RoomId::from(room), JoinOptions::default())
            .await
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for_snapshot<F>(&self, predicate: F) -> anyhow::Result<CallSnapshot>
    where
        F: Fn(&CallSnapshot) -> bool,
    {
        let mut snapshots = self.handle.watch();
        let result =
            tokio::time::timeout(WAIT_TIMEOUT, snapshots.wait_for(|s| predicate(s))).await;
        match result {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(anyhow!("coordinator stopped publishing snapshots")),
            Err(_) => Err(anyhow!(
                "timed out waiting for snapshot; last state {:?}",
                self.handle.current().state
            )),
        }
    }

    /// Wait until the call state equals `state`.
    pub async fn wait_for_state(&self, state: CallState) -> anyhow::Result<CallSnapshot> {
        self.wait_for_snapshot(|s| s.state == state).await
    }

    /// Wait until `count` remote participants are `Connected`.
    pub async fn wait_for_connected(&self, count: usize) -> anyhow::Result<CallSnapshot> {
        use mesh_session::actors::ConnectionState;
        self.wait_for_snapshot(|s| {
            s.remote_participants()
                .filter(|p| p.connection_state == ConnectionState::Connected)
                .count()
                == count
        })
        .await
    }

    /// Wait for the next notice matching `predicate`, skipping others.
    pub async fn wait_for_notice<F>(&mut self, predicate: F) -> anyhow::Result<SessionNotice>
    where
        F: Fn(&SessionNotice) -> bool,
    {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                match self.notices.recv().await {
                    Ok(notice) if predicate(&notice) => return Ok(notice),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("notice channel closed"))
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for notice"))?
    }

    /// Dispose the session and wait for the actor to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.dispose().await?;
        tokio::time::timeout(WAIT_TIMEOUT, self.task)
            .await
            .map_err(|_| anyhow!("coordinator did not stop"))??;
        Ok(())
    }
}
