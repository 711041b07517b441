//! The group client.
//!
//! [`GroupClient`] is the only owner of [`ClientState`]. Every operation takes the
//! state lock for bookkeeping, releases it, then performs network I/O or invokes
//! callbacks. Timers (connection retries, membership debounce) live in
//! [`TaskSlots`] so at most one is armed per key.
//!
//! The relay lifecycle lives here; inbound event processing, replication,
//! bootstrap and user actions are further `impl GroupClient` blocks in
//! `services` and `commands`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use nostr_sdk::prelude::*;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeMessage, ShellBridge};
use crate::commands::ADMIN_ROLE;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::relay::connection::{
    AttemptDecision, ConnectionStatus, RegistrationDetails, RelayMetadata,
};
use crate::relay::url::validate_relay_url;
use crate::services::bootstrap::BootstrapReport;
use crate::services::notifications::{EventBus, Notification};
use crate::services::subscriptions::{
    DispatchReport, EventHandler, NetworkSubscription, SubscribeOptions, SubscribeOutcome,
};
use crate::shared::{ResultExt, TaskSlots};
use crate::state::{ClientState, DiscoveryState, Group, Invite, JoinRequest, Member};
use crate::store::EventStore;
use crate::transport::{RelayTransport, ReplicationGateway};

/// Everything the engine talks to
pub struct Collaborators {
    pub transport: Arc<dyn RelayTransport>,
    pub gateway: Arc<dyn ReplicationGateway>,
    pub store: Arc<dyn EventStore>,
    pub bridge: Option<Arc<dyn ShellBridge>>,
}

pub(crate) type InFlightBootstrap = Shared<BoxFuture<'static, BootstrapReport>>;

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) keys: Keys,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) transport: Arc<dyn RelayTransport>,
    pub(crate) gateway: Arc<dyn ReplicationGateway>,
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) bridge: Option<Arc<dyn ShellBridge>>,
    pub(crate) bus: EventBus,
    pub(crate) retry_slots: TaskSlots<String>,
    pub(crate) debounce_slots: TaskSlots<String>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) bootstrap: std::sync::Mutex<Option<InFlightBootstrap>>,
}

#[derive(Clone)]
pub struct GroupClient {
    pub(crate) inner: Arc<Inner>,
}

impl GroupClient {
    pub fn new(config: ClientConfig, keys: Keys, collaborators: Collaborators) -> Self {
        let state = ClientState::new(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                state: Mutex::new(state),
                transport: collaborators.transport,
                gateway: collaborators.gateway,
                store: collaborators.store,
                bridge: collaborators.bridge,
                bus: EventBus::new(),
                retry_slots: TaskSlots::new(),
                debounce_slots: TaskSlots::new(),
                cancelled: AtomicBool::new(false),
                bootstrap: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keys.public_key()
    }

    pub(crate) fn my_pubkey_hex(&self) -> String {
        self.inner.keys.public_key().to_hex()
    }

    /// Notification bus for UI / embedder listeners
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub(crate) async fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner.state.lock().await
    }

    pub(crate) fn emit(&self, notification: Notification) {
        if !self.is_cancelled() {
            self.inner.bus.emit(notification);
        }
    }

    /// Sign an event with our keys at the current time
    pub(crate) fn sign(&self, kind: u16, content: &str, tags: Vec<Tag>) -> Result<Event> {
        EventBuilder::new(Kind::from(kind), content)
            .tags(tags)
            .custom_created_at(Timestamp::from_secs(crate::util::now_secs()))
            .sign_with_keys(&self.inner.keys)
            .context(Error::Nostr, "Failed to sign event")
    }

    pub(crate) async fn bridge_send(&self, message: BridgeMessage) {
        let Some(bridge) = &self.inner.bridge else {
            return;
        };
        let kind = message.kind();
        match bridge.send(message).await {
            Ok(_) => debug!(kind, "bridge message delivered"),
            Err(e) => warn!(kind, error = %e, "bridge message failed"),
        }
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    pub async fn connection_status(&self, identifier: &str) -> Option<ConnectionStatus> {
        self.state().await.connections.status(identifier)
    }

    pub async fn group(&self, group_id: &str) -> Option<Group> {
        self.state().await.groups.group(group_id).cloned()
    }

    pub async fn members(&self, group_id: &str) -> Vec<Member> {
        self.state().await.membership.members(group_id)
    }

    /// Oldest first
    pub async fn timeline(&self, group_id: &str) -> Vec<Event> {
        self.state()
            .await
            .groups
            .timeline(group_id)
            .map(|t| t.events().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn invites(&self) -> Vec<Invite> {
        let mut invites: Vec<Invite> = self.state().await.groups.invites().cloned().collect();
        invites.sort_by_key(|i| i.created_at);
        invites
    }

    pub async fn join_requests(&self, group_id: &str) -> Vec<JoinRequest> {
        self.state()
            .await
            .groups
            .join_requests(group_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn replication_cursor(&self, group_id: &str) -> u64 {
        self.state().await.replication.cursor(group_id)
    }

    pub async fn discovery(&self) -> DiscoveryState {
        self.state().await.discovery.clone()
    }

    // ------------------------------------------------------------------
    // Relay lifecycle
    // ------------------------------------------------------------------

    /// Register a relay for a group. It connects once every readiness
    /// condition holds; until then evaluation is deferred and retried.
    pub async fn queue_relay(&self, identifier: &str, url: &str, requires_auth: Option<bool>) -> Result<bool> {
        self.ensure_active()?;
        let url = validate_relay_url(url)?;
        let queued = self.state().await.connections.queue(identifier, &url, requires_auth);
        if queued {
            info!(identifier, "relay queued");
        }
        self.schedule_retry(identifier, Duration::ZERO);
        Ok(queued)
    }

    /// Worker signal: the relay for `identifier` is initialized. May arrive before
    /// the relay is queued.
    pub async fn report_initialized(
        &self,
        identifier: &str,
        url: Option<&str>,
        auth_token: Option<&str>,
        metadata: RelayMetadata,
    ) -> Result<()> {
        self.ensure_active()?;
        let (queued, relay_key) = {
            let mut state = self.state().await;
            let queued = state
                .connections
                .report_initialized(identifier, url, auth_token, metadata);
            (queued, state.connections.relay_key_for(identifier))
        };
        debug!(identifier, queued, "relay initialized");

        if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
            self.bridge_send(BridgeMessage::UpdateAuthData {
                relay_key,
                public_identifier: identifier.to_string(),
                pubkey: self.my_pubkey_hex(),
                token: token.to_string(),
            })
            .await;
        }
        if queued {
            self.schedule_retry(identifier, Duration::ZERO);
        }
        Ok(())
    }

    /// Worker signal: the relay for `identifier` is registered with the gateway.
    pub async fn report_registered(&self, identifier: &str, details: RegistrationDetails) -> Result<()> {
        self.ensure_active()?;
        let queued = self.state().await.connections.report_registered(identifier, details);
        debug!(identifier, queued, "relay registered");
        if queued {
            self.schedule_retry(identifier, Duration::ZERO);
        }
        Ok(())
    }

    /// Open or close the gateway gate. Opening retries every pending or failed
    /// relay right away.
    pub async fn set_gateway_ready(&self, ready: bool) -> Result<()> {
        self.ensure_active()?;
        let retry = self.state().await.connections.set_gateway_ready(ready);
        info!(ready, retrying = retry.len(), "gateway readiness changed");
        for identifier in retry {
            self.schedule_retry(&identifier, Duration::ZERO);
        }
        Ok(())
    }

    /// Arm the single retry timer for `identifier`, replacing any armed one.
    ///
    /// Kept synchronous so the spawned attempt never appears inside its own future type.
    pub(crate) fn schedule_retry(&self, identifier: &str, delay: Duration) {
        if self.is_cancelled() {
            return;
        }
        let client = self.clone();
        let key = identifier.to_string();
        self.inner.retry_slots.schedule(key.clone(), delay, async move {
            client.attempt_if_ready(&key).await;
        });
    }

    /// Evaluate readiness and connect if everything holds; otherwise defer.
    pub async fn attempt_if_ready(&self, identifier: &str) -> AttemptDecision {
        if self.is_cancelled() {
            return AttemptDecision::Skip { status: Some(ConnectionStatus::Cancelled) };
        }

        let decision = {
            let mut state = self.state().await;
            let decision = state.connections.evaluate(identifier);
            if let AttemptDecision::Proceed { .. } = decision {
                if !state.connections.begin_attempt(identifier) {
                    return AttemptDecision::Skip { status: state.connections.status(identifier) };
                }
            }
            decision
        };

        match &decision {
            AttemptDecision::Proceed { url } => {
                if let Err(e) = self.connect(identifier, url).await {
                    debug!(identifier, error = %e, "connect attempt ended in error");
                }
            }
            AttemptDecision::Defer { reason, delay } => {
                debug!(identifier, reason = %reason, delay = ?delay, "connection deferred");
                self.emit(Notification::RelayDeferred {
                    identifier: identifier.to_string(),
                    reason: *reason,
                    delay: *delay,
                });
                self.schedule_retry(identifier, *delay);
            }
            AttemptDecision::Skip { status } => {
                debug!(identifier, status = ?status, "attempt skipped");
            }
        }
        decision
    }

    /// User-initiated connect that bypasses readiness gating and reports the
    /// outcome to the caller.
    pub async fn connect_now(&self, identifier: &str, url: &str) -> Result<()> {
        self.ensure_active()?;
        let url = validate_relay_url(url)?;

        let started = {
            let mut state = self.state().await;
            if state.connections.status(identifier) == Some(ConnectionStatus::Connected) {
                return Ok(());
            }
            state.connections.force_attempt(identifier, &url)
        };
        if !started {
            return Err(Error::Precondition(format!(
                "A connection attempt for {} is already running",
                identifier
            )));
        }

        self.inner.retry_slots.cancel(&identifier.to_string());
        self.connect(identifier, &url).await
    }

    /// Run up to `connect_attempts` transport connects. The entry must already
    /// be marked connecting.
    async fn connect(&self, identifier: &str, url: &str) -> Result<()> {
        let attempts = self.inner.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            self.ensure_active()?;
            debug!(identifier, attempt, "connecting to relay");

            match self.inner.transport.connect(url).await {
                Ok(()) => {
                    self.on_connected(identifier, url).await;
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    let delay = self.state().await.connections.mark_auth_failed(identifier);
                    warn!(identifier, "relay rejected credentials");
                    self.emit(Notification::AuthFailed { identifier: identifier.to_string() });
                    if let Some(delay) = delay {
                        self.schedule_retry(identifier, delay);
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(identifier, attempt, error = %e, "relay connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.connect_spacing()).await;
                    }
                }
            }
        }

        self.ensure_active()?;
        let error = last_error.unwrap_or_else(|| Error::Transport("connect failed".into()));
        let delay = self.state().await.connections.mark_failed(identifier);
        self.emit(Notification::RelayFailed {
            identifier: identifier.to_string(),
            error: error.to_string(),
        });
        if let Some(delay) = delay {
            info!(identifier, delay = ?delay, "scheduling reconnect");
            self.schedule_retry(identifier, delay);
        }
        Err(error)
    }

    async fn on_connected(&self, identifier: &str, url: &str) {
        let (resubscribe, replicated) = {
            let mut state = self.state().await;
            state.connections.mark_connected(identifier, url);
            let mut subs = state.router.group_subscriptions(identifier);
            subs.extend(
                state
                    .router
                    .unscoped_subscriptions()
                    .into_iter()
                    .filter(|s| s.target_relays.is_empty()),
            );
            let replicated = state
                .groups
                .group(identifier)
                .map(|g| g.encrypted_replication)
                .unwrap_or(false);
            (subs, replicated)
        };
        self.inner.retry_slots.cancel(&identifier.to_string());

        for sub in &resubscribe {
            if let Err(e) = self.inner.transport.subscribe(url, &sub.wire_id, &sub.filters).await {
                warn!(identifier, wire_id = %sub.wire_id, error = %e, "resubscribe failed");
            }
        }
        info!(identifier, subscriptions = resubscribe.len(), "relay connected");
        self.emit(Notification::RelayConnected {
            identifier: identifier.to_string(),
            url: url.to_string(),
        });

        // Catch up on anything the cache or the gateway saw while we were away
        if let Err(e) = self.replay_from_cache(identifier).await {
            warn!(group_id = identifier, error = %e, "cache replay failed");
        }
        if replicated {
            if let Err(e) = self.fetch_snapshot(identifier).await {
                warn!(group_id = identifier, error = %e, "replication snapshot failed");
            }
        }
    }

    /// Transport signal: an established connection dropped.
    pub async fn handle_disconnect(&self, identifier: &str) -> Result<()> {
        self.ensure_active()?;
        let (dropped, delay) = {
            let mut state = self.state().await;
            let dropped = state.connections.mark_disconnected(identifier);
            (dropped, state.connections.policy().backoff(0))
        };
        if dropped {
            info!(identifier, "relay disconnected");
            self.schedule_retry(identifier, delay);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    fn targets_for(state: &ClientState, sub: &NetworkSubscription) -> Vec<String> {
        if !sub.target_relays.is_empty() {
            return sub.target_relays.clone();
        }
        match &sub.group_id {
            Some(group_id) => state
                .connections
                .connection(group_id)
                .filter(|c| c.status == ConnectionStatus::Connected)
                .and_then(|c| c.url.clone())
                .into_iter()
                .collect(),
            None => state.connections.connected().into_iter().map(|(_, url)| url).collect(),
        }
    }

    pub async fn subscribe(
        &self,
        id: &str,
        filters: Vec<Filter>,
        handler: EventHandler,
        opts: SubscribeOptions,
    ) -> Result<SubscribeOutcome> {
        self.ensure_active()?;
        let (outcome, targets) = {
            let mut state = self.state().await;
            let outcome = state.router.subscribe(id, filters, handler, opts)?;
            let targets = match &outcome {
                SubscribeOutcome::Opened(net) => Self::targets_for(&state, net),
                SubscribeOutcome::Reused { .. } => Vec::new(),
            };
            (outcome, targets)
        };

        if let SubscribeOutcome::Opened(net) = &outcome {
            for url in &targets {
                if let Err(e) = self.inner.transport.subscribe(url, &net.wire_id, &net.filters).await {
                    warn!(id, relay = %url, error = %e, "subscribe failed");
                }
            }
            debug!(id, wire_id = %net.wire_id, relays = targets.len(), "subscription opened");
        }
        Ok(outcome)
    }

    async fn close_network(&self, closed: Vec<(NetworkSubscription, Vec<String>)>) {
        for (sub, targets) in closed {
            for url in targets {
                if let Err(e) = self.inner.transport.close_subscription(&url, &sub.wire_id).await {
                    debug!(wire_id = %sub.wire_id, relay = %url, error = %e, "close failed");
                }
            }
        }
    }

    /// Returns true if the network subscription was closed
    pub async fn unsubscribe(&self, id: &str) -> Result<bool> {
        self.ensure_active()?;
        let closed = {
            let mut state = self.state().await;
            state
                .router
                .unsubscribe(id)
                .map(|net| {
                    let targets = Self::targets_for(&state, &net);
                    (net, targets)
                })
        };
        let was_closed = closed.is_some();
        self.close_network(closed.into_iter().collect()).await;
        Ok(was_closed)
    }

    /// Close every subscription scoped to a group. Returns how many network
    /// subscriptions were closed.
    pub async fn unsubscribe_group(&self, group_id: &str) -> Result<usize> {
        self.ensure_active()?;
        let closed: Vec<(NetworkSubscription, Vec<String>)> = {
            let mut state = self.state().await;
            let nets = state.router.unsubscribe_group(group_id);
            nets.into_iter()
                .map(|net| {
                    let targets = Self::targets_for(&state, &net);
                    (net, targets)
                })
                .collect()
        };
        let count = closed.len();
        self.close_network(closed).await;
        Ok(count)
    }

    /// Listener for events from every subscription that does not suppress them
    pub async fn add_global_listener(&self, handler: EventHandler) -> u64 {
        self.state().await.router.add_global_listener(handler)
    }

    pub async fn remove_global_listener(&self, id: u64) -> bool {
        self.state().await.router.remove_global_listener(id)
    }

    /// Transport entry point for an event received on `wire_id`.
    ///
    /// Engine state is updated first (kind dispatch), then the subscription's
    /// handlers and the global listeners run.
    pub async fn handle_relay_event(&self, wire_id: &str, event: Event, relay: &str) -> Result<DispatchReport> {
        self.ensure_active()?;
        let delivery = self.state().await.router.resolve(wire_id);
        let Some(delivery) = delivery else {
            debug!(wire_id, event_id = %event.id, "dropping event for unknown subscription");
            return Ok(DispatchReport::default());
        };

        if let Err(e) = self.process_event(&event, relay).await {
            warn!(event_id = %event.id, kind = event.kind.as_u16(), error = %e, "event processing failed");
        }
        Ok(delivery.deliver(&event, relay))
    }

    /// Publish to the group's own relay. Group events never go to another
    /// group's relay, so a group without a live connection is an error.
    pub(crate) async fn publish_to_group(&self, group_id: &str, event: &Event) -> Result<()> {
        let url = self
            .state()
            .await
            .connections
            .connection(group_id)
            .filter(|c| c.status == ConnectionStatus::Connected)
            .and_then(|c| c.url.clone())
            .ok_or_else(|| Error::Transport(format!("Relay for group {} is not connected", group_id)))?;

        if let Err(e) = self.inner.transport.publish(&url, event).await {
            warn!(group_id, relay = %url, error = %e, "publish failed");
            return Err(e);
        }
        debug!(group_id, event_id = %event.id, "event published");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Re-derive a group's members now. Emits and syncs the bridge only when the
    /// member set changed.
    pub async fn recompute_membership(&self, group_id: &str) -> Option<Vec<Member>> {
        if self.is_cancelled() {
            return None;
        }
        let (changed, bridge_message, promoted) = {
            let mut state = self.state().await;
            let changed = state.membership.recompute(group_id);
            let message = match (&changed, state.membership.ledger(group_id)) {
                (Some(_), Some(ledger)) => {
                    let relay_key = state
                        .connections
                        .relay_key_for(group_id)
                        .or_else(|| state.groups.group(group_id).and_then(|g| g.relay_key.clone()));
                    Some(BridgeMessage::update_members(relay_key, group_id, ledger))
                }
                _ => None,
            };
            let promoted = match &changed {
                Some(_) => {
                    let ClientState { membership, replication, .. } = &mut *state;
                    replication.promote_pending(group_id, |sender| membership.has_role(group_id, sender, ADMIN_ROLE))
                }
                None => Vec::new(),
            };
            (changed, message, promoted)
        };

        let members = changed?;
        debug!(group_id, members = members.len(), "membership changed");
        self.emit(Notification::MembersChanged {
            group_id: group_id.to_string(),
            members: members.clone(),
        });
        for created_at in promoted {
            info!(group_id, created_at, "held replication secret registered");
            self.emit(Notification::SecretRegistered {
                group_id: group_id.to_string(),
                created_at,
            });
        }
        if let Some(message) = bridge_message {
            self.bridge_send(message).await;
        }
        Some(members)
    }

    /// Recompute after the debounce window; further writes restart the window.
    pub fn debounced_recompute(&self, group_id: &str) {
        if self.is_cancelled() {
            return;
        }
        let client = self.clone();
        let key = group_id.to_string();
        self.inner
            .debounce_slots
            .schedule(key.clone(), self.inner.config.membership_debounce(), async move {
                client.recompute_membership(&key).await;
            });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop everything. Idempotent. With `clear_cache` the event store and all
    /// cached group state are wiped too.
    pub async fn shutdown(&self, clear_cache: bool) -> Result<()> {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.retry_slots.cancel_all();
        self.inner.debounce_slots.cancel_all();

        let (connected, open) = {
            let mut state = self.state().await;
            let connected = state.connections.shutdown();
            let open: Vec<(NetworkSubscription, Vec<String>)> = state
                .router
                .clear()
                .into_iter()
                .map(|net| {
                    let mut targets = net.target_relays.clone();
                    if targets.is_empty() {
                        targets = connected.iter().map(|(_, url)| url.clone()).collect();
                    }
                    (net, targets)
                })
                .collect();
            if clear_cache {
                state.clear_cache();
            }
            (connected, open)
        };

        self.close_network(open).await;
        for (identifier, url) in connected {
            if let Err(e) = self.inner.transport.disconnect(&url).await {
                debug!(identifier, error = %e, "disconnect failed");
            }
        }
        if clear_cache {
            self.inner.store.clear_all().await?;
        }
        info!(clear_cache, "client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::DeferReason;
    use crate::services::notifications::Topic;
    use crate::testing::{harness, Harness};
    use std::sync::Mutex as StdMutex;

    async fn make_ready(h: &Harness, id: &str) {
        h.client
            .report_initialized(id, None, None, RelayMetadata::default())
            .await
            .unwrap();
        h.client
            .report_registered(id, RegistrationDetails::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_without_readiness_stays_pending_then_connects() {
        let h = harness();
        h.transport.set_connect_delay(Duration::from_millis(500));

        h.client.queue_relay("g1", "wss://r1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Pending));
        assert!(h.transport.connects().is_empty());

        make_ready(&h, "g1").await;
        h.client.set_gateway_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Connecting));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Connected));
        assert_eq!(h.transport.connects(), vec!["wss://r1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_defers_then_connects_with_token() {
        let h = harness();
        let deferred = Arc::new(StdMutex::new(Vec::new()));
        let seen = deferred.clone();
        h.client.bus().subscribe(Topic::Relay, move |n| {
            if let Notification::RelayDeferred { reason, delay, .. } = n {
                seen.lock().unwrap().push((*reason, *delay));
            }
        });

        h.client.queue_relay("g1", "wss://r1", Some(true)).await.unwrap();
        make_ready(&h, "g1").await;
        h.client.set_gateway_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        {
            let deferred = deferred.lock().unwrap();
            let missing: Vec<_> = deferred
                .iter()
                .filter(|(r, _)| *r == DeferReason::MissingToken)
                .collect();
            // Evaluated once up front and once more after the 2s retry
            assert!(missing.len() >= 2);
            assert!(missing.iter().all(|(_, d)| *d == Duration::from_secs(2)));
        }
        assert!(h.transport.connects().is_empty());

        h.client
            .report_initialized("g1", Some("wss://r1?token=abc"), None, RelayMetadata::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Connected));
        assert_eq!(h.transport.connects(), vec!["wss://r1?token=abc".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_order_converges() {
        let h = harness();
        h.client.set_gateway_ready(true).await.unwrap();
        h.client.queue_relay("a", "wss://a", None).await.unwrap();
        h.client.queue_relay("b", "wss://b", None).await.unwrap();

        h.client.report_registered("a", RegistrationDetails::default()).await.unwrap();
        h.client.report_initialized("a", None, None, RelayMetadata::default()).await.unwrap();
        h.client.report_initialized("b", None, None, RelayMetadata::default()).await.unwrap();
        h.client.report_registered("b", RegistrationDetails::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.client.connection_status("a").await, Some(ConnectionStatus::Connected));
        assert_eq!(h.client.connection_status("b").await, Some(ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_now_exhausts_attempts_then_backs_off() {
        let h = harness();
        h.transport.fail_connects(3);

        let err = h.client.connect_now("g1", "wss://r1").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(h.transport.connects().len(), 3);
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Failed));
        assert!(h.client.inner.retry_slots.is_scheduled(&"g1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_rearms_and_notifies() {
        let h = harness();
        h.transport.fail_auth(1);
        let auth_failures = Arc::new(StdMutex::new(0));
        let counter = auth_failures.clone();
        h.client.bus().subscribe(Topic::Auth, move |_| *counter.lock().unwrap() += 1);

        let err = h.client.connect_now("g1", "wss://r1?token=old").await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(*auth_failures.lock().unwrap(), 1);
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Pending));
        assert!(h.client.inner.retry_slots.is_scheduled(&"g1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_subscriptions_resent_on_connect() {
        let h = harness();
        let filter = Filter::new()
            .kind(Kind::from(9))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), "g1");
        let opts = SubscribeOptions { group_id: Some("g1".into()), ..Default::default() };
        h.client
            .subscribe("g1-chat", vec![filter], Arc::new(|_, _| Ok(())), opts)
            .await
            .unwrap();
        // Not connected yet: nothing sent
        assert!(h.transport.subscriptions().is_empty());

        h.client.connect_now("g1", "wss://r1").await.unwrap();
        assert_eq!(
            h.transport.subscriptions(),
            vec![("wss://r1".to_string(), "g1-chat".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_subscription_closes_with_last_subscriber() {
        let h = harness();
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        let filter = Filter::new().kind(Kind::from(9));
        let opts = SubscribeOptions { group_id: Some("g1".into()), ..Default::default() };

        h.client
            .subscribe("a", vec![filter.clone()], Arc::new(|_, _| Ok(())), opts.clone())
            .await
            .unwrap();
        let second = h
            .client
            .subscribe("b", vec![filter], Arc::new(|_, _| Ok(())), opts)
            .await
            .unwrap();
        assert!(matches!(second, SubscribeOutcome::Reused { .. }));
        assert_eq!(h.transport.subscriptions().len(), 1);

        assert!(!h.client.unsubscribe("a").await.unwrap());
        assert!(h.transport.closes().is_empty());
        assert!(h.client.unsubscribe("b").await.unwrap());
        assert_eq!(h.transport.closes(), vec![("wss://r1".to_string(), "a".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_filters_on_another_relay_are_subscribed_there() {
        let h = harness();
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        h.client.connect_now("g2", "wss://r2").await.unwrap();
        let filter = Filter::new().kind(Kind::from(0));
        let on = |relay: &str| SubscribeOptions { target_relays: vec![relay.to_string()], ..Default::default() };

        h.client
            .subscribe("a", vec![filter.clone()], Arc::new(|_, _| Ok(())), on("wss://r1"))
            .await
            .unwrap();
        h.client
            .subscribe("b", vec![filter], Arc::new(|_, _| Ok(())), on("wss://r2"))
            .await
            .unwrap();

        assert_eq!(
            h.transport.subscriptions(),
            vec![
                ("wss://r1".to_string(), "a".to_string()),
                ("wss://r2".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let h = harness();
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        h.client.queue_relay("g2", "wss://r2", None).await.unwrap();

        h.client.shutdown(false).await.unwrap();
        assert_eq!(h.transport.disconnects(), vec!["wss://r1".to_string()]);
        assert_eq!(h.client.inner.retry_slots.pending_count(), 0);
        assert!(matches!(h.client.queue_relay("g3", "wss://r3", None).await, Err(Error::Cancelled)));
        assert_eq!(
            h.client.attempt_if_ready("g2").await,
            AttemptDecision::Skip { status: Some(ConnectionStatus::Cancelled) }
        );
        // Second shutdown is a no-op
        h.client.shutdown(true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_token_is_pushed_to_bridge() {
        let h = harness();
        h.client
            .report_initialized(
                "g1",
                Some("wss://r1"),
                Some("tok"),
                RelayMetadata { relay_key: Some("rk".into()), requires_auth: Some(true) },
            )
            .await
            .unwrap();

        let sent = h.bridge.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            BridgeMessage::UpdateAuthData { relay_key, public_identifier, token, .. } => {
                assert_eq!(relay_key.as_deref(), Some("rk"));
                assert_eq!(public_identifier, "g1");
                assert_eq!(token, "tok");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
