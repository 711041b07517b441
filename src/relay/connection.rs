//! Relay connection lifecycle.
//!
//! One [`RelayConnection`] per public group identifier moves through
//!
//! ```text
//! pending ──► connecting ──► connected
//!    ▲            │
//!    └── failed ◄─┘          (any) ──shutdown──► cancelled
//! ```
//!
//! Readiness signals (`initialized`, `registered`) come from the worker and may
//! arrive before the relay is queued, so they are buffered per identifier and
//! merged when `queue` runs. This module is pure bookkeeping: it decides, the
//! client executes (connects, arms timers, emits notifications).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::relay::url::{has_token, prefer_url, with_token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Connecting,
    Connected,
    Failed,
    Cancelled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses from which a new attempt may start
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionStatus::Pending | ConnectionStatus::Failed)
    }
}

/// Why an attempt was postponed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeferReason {
    NotInitialized,
    NotRegistered,
    GatewayNotReady,
    UrlUnavailable,
    MissingToken,
    AuthFailed,
    ConnectFailed,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::NotInitialized => "not-initialized",
            DeferReason::NotRegistered => "not-registered",
            DeferReason::GatewayNotReady => "gateway-not-ready",
            DeferReason::UrlUnavailable => "url-unavailable",
            DeferReason::MissingToken => "missing-token",
            DeferReason::AuthFailed => "auth-failed",
            DeferReason::ConnectFailed => "connect-failed",
        }
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra data carried by an `initialized` signal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetadata {
    #[serde(default)]
    pub relay_key: Option<String>,
    #[serde(default)]
    pub requires_auth: Option<bool>,
}

/// Extra data carried by a `registered` signal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationDetails {
    #[serde(default)]
    pub relay_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub requires_auth: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConnection {
    pub identifier: String,
    pub url: Option<String>,
    pub status: ConnectionStatus,
    /// Failed connects since the last success
    pub attempts: u32,
    pub is_initialized: bool,
    pub is_registered: bool,
    pub requires_auth: bool,
    pub relay_key: Option<String>,
}

impl RelayConnection {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            url: None,
            status: ConnectionStatus::Pending,
            attempts: 0,
            is_initialized: false,
            is_registered: false,
            requires_auth: false,
            relay_key: None,
        }
    }
}

/// Buffered readiness for an identifier, independent of whether it is queued
#[derive(Debug, Clone, Default)]
struct Readiness {
    url: Option<String>,
    initialized: bool,
    registered: bool,
    requires_auth: Option<bool>,
    relay_key: Option<String>,
}

impl Readiness {
    fn merge_url(&mut self, url: &str) {
        self.url = Some(prefer_url(self.url.as_deref(), url));
    }

    fn apply_to(&self, conn: &mut RelayConnection) {
        if let Some(url) = &self.url {
            conn.url = Some(prefer_url(conn.url.as_deref(), url));
        }
        conn.is_initialized |= self.initialized;
        conn.is_registered |= self.registered;
        if let Some(requires_auth) = self.requires_auth {
            conn.requires_auth = requires_auth;
        }
        if self.relay_key.is_some() {
            conn.relay_key = self.relay_key.clone();
        }
    }
}

/// Outcome of evaluating an identifier for connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    /// All preconditions hold; connect to `url`
    Proceed { url: String },
    /// Try again after `delay`
    Defer { reason: DeferReason, delay: Duration },
    /// Nothing to do (unknown, already connecting/connected, or cancelled)
    Skip { status: Option<ConnectionStatus> },
}

#[derive(Debug)]
pub struct RelayConnectionManager {
    policy: RetryPolicy,
    connections: HashMap<String, RelayConnection>,
    readiness: HashMap<String, Readiness>,
    gateway_ready: bool,
    cancelled: bool,
}

impl RelayConnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            connections: HashMap::new(),
            readiness: HashMap::new(),
            gateway_ready: false,
            cancelled: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn connection(&self, identifier: &str) -> Option<&RelayConnection> {
        self.connections.get(identifier)
    }

    pub fn status(&self, identifier: &str) -> Option<ConnectionStatus> {
        self.connections.get(identifier).map(|c| c.status)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_gateway_ready(&self) -> bool {
        self.gateway_ready
    }

    /// Identifiers currently connected, with their URLs
    pub fn connected(&self) -> Vec<(String, String)> {
        self.connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .filter_map(|c| Some((c.identifier.clone(), c.url.clone()?)))
            .collect()
    }

    /// Best known URL for an identifier, queued or not
    pub fn url_for(&self, identifier: &str) -> Option<String> {
        self.connections
            .get(identifier)
            .and_then(|c| c.url.clone())
            .or_else(|| self.readiness.get(identifier).and_then(|r| r.url.clone()))
    }

    pub fn relay_key_for(&self, identifier: &str) -> Option<String> {
        self.connections
            .get(identifier)
            .and_then(|c| c.relay_key.clone())
            .or_else(|| self.readiness.get(identifier).and_then(|r| r.relay_key.clone()))
    }

    /// Register a pending connection. Returns false if one already exists
    /// (its URL is still merged) or the manager is cancelled.
    pub fn queue(&mut self, identifier: &str, url: &str, requires_auth: Option<bool>) -> bool {
        if self.cancelled {
            return false;
        }

        if let Some(existing) = self.connections.get_mut(identifier) {
            existing.url = Some(prefer_url(existing.url.as_deref(), url));
            if let Some(requires_auth) = requires_auth {
                existing.requires_auth = requires_auth;
            }
            return false;
        }

        let mut conn = RelayConnection::new(identifier);
        conn.url = Some(url.to_string());
        if let Some(requires_auth) = requires_auth {
            conn.requires_auth = requires_auth;
        }
        if let Some(buffered) = self.readiness.get(identifier) {
            buffered.apply_to(&mut conn);
        }
        self.connections.insert(identifier.to_string(), conn);
        true
    }

    /// Record that the worker initialized the relay. Always buffered; merged into
    /// the live entry if queued. Returns true if the identifier is queued.
    pub fn report_initialized(
        &mut self,
        identifier: &str,
        url: Option<&str>,
        auth_token: Option<&str>,
        metadata: RelayMetadata,
    ) -> bool {
        if self.cancelled {
            return false;
        }

        let url = match (url, auth_token) {
            (Some(url), Some(token)) if !has_token(url) => with_token(url, token).ok(),
            (Some(url), _) => Some(url.to_string()),
            (None, _) => None,
        };

        let buffered = self.readiness.entry(identifier.to_string()).or_default();
        buffered.initialized = true;
        if let Some(url) = &url {
            buffered.merge_url(url);
        }
        if metadata.requires_auth.is_some() {
            buffered.requires_auth = metadata.requires_auth;
        }
        if metadata.relay_key.is_some() {
            buffered.relay_key = metadata.relay_key;
        }

        let buffered = buffered.clone();
        match self.connections.get_mut(identifier) {
            Some(conn) => {
                buffered.apply_to(conn);
                // A URL without a token can still carry one via auth_token on an existing entry
                if let (Some(token), Some(current)) = (auth_token, conn.url.clone()) {
                    if !has_token(&current) {
                        if let Ok(tokened) = with_token(&current, token) {
                            conn.url = Some(tokened);
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Record that the relay is registered with the gateway. Same buffering as
    /// [`report_initialized`](Self::report_initialized).
    pub fn report_registered(&mut self, identifier: &str, details: RegistrationDetails) -> bool {
        if self.cancelled {
            return false;
        }

        let buffered = self.readiness.entry(identifier.to_string()).or_default();
        buffered.registered = true;
        if let Some(url) = &details.url {
            buffered.merge_url(url);
        }
        if details.requires_auth.is_some() {
            buffered.requires_auth = details.requires_auth;
        }
        if details.relay_key.is_some() {
            buffered.relay_key = details.relay_key;
        }

        let buffered = buffered.clone();
        match self.connections.get_mut(identifier) {
            Some(conn) => {
                buffered.apply_to(conn);
                true
            }
            None => false,
        }
    }

    /// Flip the global gateway gate. Returns the identifiers to retry immediately
    /// when the gate opens; closing it only blocks new attempts.
    pub fn set_gateway_ready(&mut self, ready: bool) -> Vec<String> {
        if self.cancelled {
            return Vec::new();
        }
        let opened = ready && !self.gateway_ready;
        self.gateway_ready = ready;
        if !opened {
            return Vec::new();
        }

        let mut ids: Vec<String> = self
            .connections
            .values()
            .filter(|c| c.status.is_retryable())
            .map(|c| c.identifier.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Decide whether `identifier` can connect now.
    pub fn evaluate(&self, identifier: &str) -> AttemptDecision {
        if self.cancelled {
            return AttemptDecision::Skip { status: Some(ConnectionStatus::Cancelled) };
        }
        let conn = match self.connections.get(identifier) {
            Some(conn) => conn,
            None => return AttemptDecision::Skip { status: None },
        };
        if !conn.status.is_retryable() {
            return AttemptDecision::Skip { status: Some(conn.status) };
        }

        let not_ready = Duration::from_millis(self.policy.not_ready_delay_ms);
        let url_delay = Duration::from_millis(self.policy.url_unavailable_delay_ms);

        if !conn.is_initialized {
            return AttemptDecision::Defer { reason: DeferReason::NotInitialized, delay: not_ready };
        }
        if !conn.is_registered {
            return AttemptDecision::Defer { reason: DeferReason::NotRegistered, delay: not_ready };
        }
        if !self.gateway_ready {
            return AttemptDecision::Defer { reason: DeferReason::GatewayNotReady, delay: not_ready };
        }
        let url = match &conn.url {
            Some(url) if !url.is_empty() => url,
            _ => return AttemptDecision::Defer { reason: DeferReason::UrlUnavailable, delay: url_delay },
        };
        if conn.requires_auth && !has_token(url) {
            return AttemptDecision::Defer { reason: DeferReason::MissingToken, delay: url_delay };
        }

        AttemptDecision::Proceed { url: url.clone() }
    }

    /// Mark the start of a live attempt. Returns false if one is already running
    /// (or the entry is unknown / cancelled / connected).
    pub fn begin_attempt(&mut self, identifier: &str) -> bool {
        if self.cancelled {
            return false;
        }
        match self.connections.get_mut(identifier) {
            Some(conn) if conn.status.is_retryable() => {
                conn.status = ConnectionStatus::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Create the entry if needed and mark it connecting, bypassing readiness.
    /// Used by user-initiated connects.
    pub fn force_attempt(&mut self, identifier: &str, url: &str) -> bool {
        if self.cancelled {
            return false;
        }
        self.queue(identifier, url, None);
        self.begin_attempt(identifier)
    }

    pub fn mark_connected(&mut self, identifier: &str, url: &str) {
        if self.cancelled {
            return;
        }
        if let Some(conn) = self.connections.get_mut(identifier) {
            conn.status = ConnectionStatus::Connected;
            conn.attempts = 0;
            conn.url = Some(url.to_string());
        }
    }

    /// Record a failed connect; returns the backoff before the next attempt.
    pub fn mark_failed(&mut self, identifier: &str) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        let conn = self.connections.get_mut(identifier)?;
        let delay = self.policy.backoff(conn.attempts);
        conn.attempts = conn.attempts.saturating_add(1);
        conn.status = ConnectionStatus::Failed;
        Some(delay)
    }

    /// Record a credential rejection: the entry is re-armed as pending and retried
    /// after the fixed auth delay.
    pub fn mark_auth_failed(&mut self, identifier: &str) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        let conn = self.connections.get_mut(identifier)?;
        conn.attempts = conn.attempts.saturating_add(1);
        conn.status = ConnectionStatus::Pending;
        Some(Duration::from_millis(self.policy.auth_failure_delay_ms))
    }

    /// A connected relay dropped; back to pending so it is retried.
    pub fn mark_disconnected(&mut self, identifier: &str) -> bool {
        if self.cancelled {
            return false;
        }
        match self.connections.get_mut(identifier) {
            Some(conn) if conn.status == ConnectionStatus::Connected => {
                conn.status = ConnectionStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// Forget an identifier entirely (leave group)
    pub fn remove(&mut self, identifier: &str) -> Option<RelayConnection> {
        self.readiness.remove(identifier);
        self.connections.remove(identifier)
    }

    /// Terminal: everything is cancelled and no further transitions happen.
    /// Returns the identifiers that were connected so the caller can close them.
    pub fn shutdown(&mut self) -> Vec<(String, String)> {
        let connected = self.connected();
        self.cancelled = true;
        for conn in self.connections.values_mut() {
            conn.status = ConnectionStatus::Cancelled;
        }
        self.readiness.clear();
        connected
    }
}
