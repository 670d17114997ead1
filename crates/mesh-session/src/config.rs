//! Session layer configuration.
//!
//! Configuration is loaded from environment variables. Credentials embedded
//! in the relay URL are redacted in Debug output.

use crate::recovery::RetryPolicy;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default public STUN servers used for address discovery.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default per-link negotiation timeout in seconds.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECONDS: u64 = 15;

/// Default join timeout in seconds.
pub const DEFAULT_JOIN_TIMEOUT_SECONDS: u64 = 20;

/// Default grace period after losing the relay connection, in seconds.
pub const DEFAULT_SIGNALING_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default number of relay reconnect attempts.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first reconnect attempt, in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 500;

/// Default upper bound on the reconnect delay, in milliseconds.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5000;

/// Session layer configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// Signaling relay URL (`ws://` or `wss://`). May carry credentials.
    pub relay_url: String,

    /// ICE servers handed to every peer link.
    pub stun_urls: Vec<String>,

    /// Time a link may spend negotiating before it is failed (default: 15).
    pub negotiation_timeout_seconds: u64,

    /// Time a join may take before it is failed (default: 20).
    pub join_timeout_seconds: u64,

    /// Time the call survives a lost relay connection (default: 30).
    pub signaling_grace_period_seconds: u64,

    /// Relay reconnect attempts before giving up (default: 3).
    pub reconnect_max_attempts: u32,

    /// First reconnect delay in milliseconds (default: 500).
    pub reconnect_initial_delay_ms: u64,

    /// Reconnect delay cap in milliseconds (default: 5000).
    pub reconnect_max_delay_ms: u64,

    /// Whether a join may fall back to audio-only or video-only media.
    pub allow_degraded_media: bool,
}

/// Custom Debug implementation that redacts relay credentials.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("relay_url", &redact_url(&self.relay_url))
            .field("stun_urls", &self.stun_urls)
            .field(
                "negotiation_timeout_seconds",
                &self.negotiation_timeout_seconds,
            )
            .field("join_timeout_seconds", &self.join_timeout_seconds)
            .field(
                "signaling_grace_period_seconds",
                &self.signaling_grace_period_seconds,
            )
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field(
                "reconnect_initial_delay_ms",
                &self.reconnect_initial_delay_ms,
            )
            .field("reconnect_max_delay_ms", &self.reconnect_max_delay_ms)
            .field("allow_degraded_media", &self.allow_degraded_media)
            .finish()
    }
}

/// Strip user info and query parameters, which is where relay tokens live.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            let had_credentials = !parsed.username().is_empty() || parsed.password().is_some();
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            let had_query = parsed.query().is_some();
            parsed.set_query(None);
            if had_credentials || had_query {
                format!("{parsed} [REDACTED]")
            } else {
                parsed.to_string()
            }
        }
        Err(_) => "[REDACTED]".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let relay_url = vars
            .get("MESH_RELAY_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MESH_RELAY_URL".to_string()))?
            .clone();

        let parsed = url::Url::parse(&relay_url)
            .map_err(|e| ConfigError::InvalidValue(format!("MESH_RELAY_URL: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue(format!(
                "MESH_RELAY_URL: unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let stun_urls = match vars.get("MESH_STUN_URLS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => DEFAULT_STUN_URLS.iter().map(ToString::to_string).collect(),
        };

        let negotiation_timeout_seconds = parse_var(
            vars,
            "MESH_NEGOTIATION_TIMEOUT_SECONDS",
            DEFAULT_NEGOTIATION_TIMEOUT_SECONDS,
        )?;
        let join_timeout_seconds =
            parse_var(vars, "MESH_JOIN_TIMEOUT_SECONDS", DEFAULT_JOIN_TIMEOUT_SECONDS)?;
        let signaling_grace_period_seconds = parse_var(
            vars,
            "MESH_SIGNALING_GRACE_PERIOD_SECONDS",
            DEFAULT_SIGNALING_GRACE_PERIOD_SECONDS,
        )?;
        let reconnect_max_attempts = parse_var(
            vars,
            "MESH_RECONNECT_MAX_ATTEMPTS",
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
        )?;
        let reconnect_initial_delay_ms = parse_var(
            vars,
            "MESH_RECONNECT_INITIAL_DELAY_MS",
            DEFAULT_RECONNECT_INITIAL_DELAY_MS,
        )?;
        let reconnect_max_delay_ms = parse_var(
            vars,
            "MESH_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
        )?;
        let allow_degraded_media = parse_var(vars, "MESH_ALLOW_DEGRADED_MEDIA", true)?;

        if negotiation_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_NEGOTIATION_TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }
        if join_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_JOIN_TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }
        if reconnect_initial_delay_ms > reconnect_max_delay_ms {
            return Err(ConfigError::InvalidValue(
                "MESH_RECONNECT_INITIAL_DELAY_MS exceeds MESH_RECONNECT_MAX_DELAY_MS".to_string(),
            ));
        }

        Ok(SessionConfig {
            relay_url,
            stun_urls,
            negotiation_timeout_seconds,
            join_timeout_seconds,
            signaling_grace_period_seconds,
            reconnect_max_attempts,
            reconnect_initial_delay_ms,
            reconnect_max_delay_ms,
            allow_degraded_media,
        })
    }

    /// Configuration with every default and the given relay URL.
    #[must_use]
    pub fn with_relay_url(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(ToString::to_string).collect(),
            negotiation_timeout_seconds: DEFAULT_NEGOTIATION_TIMEOUT_SECONDS,
            join_timeout_seconds: DEFAULT_JOIN_TIMEOUT_SECONDS,
            signaling_grace_period_seconds: DEFAULT_SIGNALING_GRACE_PERIOD_SECONDS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            allow_degraded_media: true,
        }
    }

    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_seconds)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }

    #[must_use]
    pub fn signaling_grace_period(&self) -> Duration {
        Duration::from_secs(self.signaling_grace_period_seconds)
    }

    /// Backoff policy for relay reconnects.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_max_attempts,
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: '{raw}'"))),
        None => Ok(default),
    }
}
