//! Session tuning knobs.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::identity::DEFAULT_NAMESPACE;
use crate::domain::session::Role;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prefix for every identity derived by this process.
    pub identity_namespace: String,
    /// Relay / traversal servers handed to the transport untouched.
    pub relay_servers: Vec<String>,
    /// How long `initialize` waits for the signaling layer to answer.
    pub signaling_probe_timeout_ms: u64,
    /// Number of collision retries after the first registration attempt.
    pub identity_retry_ceiling: u32,
    pub identity_retry_delay_ms: u64,
    /// Host: time allowed for the first joiner to arrive.
    pub host_connect_timeout_ms: u64,
    /// Joiner: time allowed for the channel to the host to open.
    pub joiner_connect_timeout_ms: u64,
    /// Period of the signaling liveness probe.
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_namespace: DEFAULT_NAMESPACE.to_owned(),
            relay_servers: Vec::new(),
            signaling_probe_timeout_ms: 5_000,
            identity_retry_ceiling: 3,
            identity_retry_delay_ms: 1_000,
            host_connect_timeout_ms: 30_000,
            joiner_connect_timeout_ms: 15_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.identity_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_relay_servers(mut self, servers: Vec<String>) -> Self {
        self.relay_servers = servers;
        self
    }

    #[must_use]
    pub fn with_signaling_probe_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_identity_retry(mut self, ceiling: u32, delay: Duration) -> Self {
        self.identity_retry_ceiling = ceiling;
        self.identity_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_connect_timeouts(mut self, host: Duration, joiner: Duration) -> Self {
        self.host_connect_timeout_ms = host.as_millis() as u64;
        self.joiner_connect_timeout_ms = joiner.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn signaling_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_probe_timeout_ms)
    }

    pub fn identity_retry_delay(&self) -> Duration {
        Duration::from_millis(self.identity_retry_delay_ms)
    }

    pub fn connect_timeout(&self, role: Role) -> Duration {
        match role {
            Role::Host => Duration::from_millis(self.host_connect_timeout_ms),
            Role::Joiner => Duration::from_millis(self.joiner_connect_timeout_ms),
        }
    }

    /// Never zero; tokio intervals panic on a zero period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}
