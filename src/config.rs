//! Client configuration.
//!
//! Every field has a default, so an empty TOML document (or `ClientConfig::default()`)
//! yields a working client. Durations are stored in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shared::ResultExt;
use crate::state::membership::MergePolicy;

/// Relay retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Linear backoff step after a failed connect
    pub base_delay_ms: u64,
    /// Upper bound for the linear backoff
    pub max_delay_ms: u64,
    /// Fixed delay after the relay rejected our credentials
    pub auth_failure_delay_ms: u64,
    /// Fixed delay when no usable URL (or no token) is known yet
    pub url_unavailable_delay_ms: u64,
    /// Fixed delay while waiting for readiness signals
    pub not_ready_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_500,
            max_delay_ms: 30_000,
            auth_failure_delay_ms: 5_000,
            url_unavailable_delay_ms: 2_000,
            not_ready_delay_ms: 1_500,
        }
    }
}

impl RetryPolicy {
    /// Backoff after `attempts` failed connects: `min(max, base * (attempts + 1))`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let scaled = self.base_delay_ms.saturating_mul(attempts as u64 + 1);
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }
}

/// Gateway relay settings used for encrypted replication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    /// e.g. `wss://gateway.hypertuna.com`
    pub base_url: Option<String>,
    /// Token appended to every gateway URL when no per-group token is known
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Immediate attempts inside one `connect` call
    pub connect_attempts: u32,
    /// Spacing between those attempts
    pub connect_spacing_ms: u64,
    /// Quiet period before a debounced membership recompute
    pub membership_debounce_ms: u64,
    pub merge_policy: MergePolicy,
    /// Wall-clock bound on a gateway snapshot fetch
    pub snapshot_window_ms: u64,
    /// Timeout for each discovery fetch during bootstrap
    pub bootstrap_fetch_timeout_ms: u64,
    /// Maximum events pulled from the cache per replay
    pub replay_limit: usize,
    pub gateway: GatewaySettings,
    /// Relays used for profile / follow list / relay list discovery
    pub discovery_relays: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_attempts: 3,
            connect_spacing_ms: 2_000,
            membership_debounce_ms: 300,
            merge_policy: MergePolicy::default(),
            snapshot_window_ms: 3_000,
            bootstrap_fetch_timeout_ms: 10_000,
            replay_limit: 500,
            gateway: GatewaySettings::default(),
            discovery_relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
            ],
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Load a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(crate::error::Error::Store, || format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn connect_spacing(&self) -> Duration {
        Duration::from_millis(self.connect_spacing_ms)
    }

    pub fn membership_debounce(&self) -> Duration {
        Duration::from_millis(self.membership_debounce_ms)
    }

    pub fn snapshot_window(&self) -> Duration {
        Duration::from_millis(self.snapshot_window_ms)
    }

    pub fn bootstrap_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_fetch_timeout_ms)
    }
}
