//! Recording collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;

use crate::bridge::{BridgeMessage, ShellBridge};
use crate::client::{Collaborators, GroupClient};
use crate::config::{ClientConfig, GatewaySettings};
use crate::error::{Error, Result};
use crate::store::MemoryEventStore;
use crate::transport::{RelayTransport, ReplicationGateway, ReplicationWireEvent};

pub const GATEWAY_BASE: &str = "wss://gateway.test";

#[derive(Default)]
struct TransportLog {
    connects: Vec<String>,
    disconnects: Vec<String>,
    subscriptions: Vec<(String, String)>,
    closes: Vec<(String, String)>,
    published: Vec<(String, Event)>,
    connect_delay: Duration,
    connect_failures: u32,
    auth_failures: u32,
    fetch_delay: Duration,
    fetch_results: HashMap<u16, Vec<Event>>,
    fetch_failures: HashSet<u16>,
    fetch_calls: usize,
}

#[derive(Default)]
pub struct MockTransport {
    log: Mutex<TransportLog>,
}

impl MockTransport {
    pub fn set_connect_delay(&self, delay: Duration) {
        self.log.lock().unwrap().connect_delay = delay;
    }

    /// Fail the next `n` connects with a transport error
    pub fn fail_connects(&self, n: u32) {
        self.log.lock().unwrap().connect_failures = n;
    }

    /// Fail the next `n` connects with an auth rejection
    pub fn fail_auth(&self, n: u32) {
        self.log.lock().unwrap().auth_failures = n;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.log.lock().unwrap().fetch_delay = delay;
    }

    pub fn set_fetch_result(&self, kind: u16, events: Vec<Event>) {
        self.log.lock().unwrap().fetch_results.insert(kind, events);
    }

    pub fn fail_fetch(&self, kind: u16) {
        self.log.lock().unwrap().fetch_failures.insert(kind);
    }

    pub fn connects(&self) -> Vec<String> {
        self.log.lock().unwrap().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.log.lock().unwrap().disconnects.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().subscriptions.clone()
    }

    pub fn closes(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().closes.clone()
    }

    pub fn published(&self) -> Vec<(String, Event)> {
        self.log.lock().unwrap().published.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.log.lock().unwrap().fetch_calls
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn connect(&self, url: &str) -> Result<()> {
        let delay = {
            let mut log = self.log.lock().unwrap();
            log.connects.push(url.to_string());
            log.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut log = self.log.lock().unwrap();
        if log.auth_failures > 0 {
            log.auth_failures -= 1;
            return Err(Error::Auth(format!("{} rejected token", url)));
        }
        if log.connect_failures > 0 {
            log.connect_failures -= 1;
            return Err(Error::Transport(format!("{} unreachable", url)));
        }
        Ok(())
    }

    async fn disconnect(&self, url: &str) -> Result<()> {
        self.log.lock().unwrap().disconnects.push(url.to_string());
        Ok(())
    }

    async fn subscribe(&self, url: &str, wire_id: &str, _filters: &[Filter]) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .subscriptions
            .push((url.to_string(), wire_id.to_string()));
        Ok(())
    }

    async fn close_subscription(&self, url: &str, wire_id: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .closes
            .push((url.to_string(), wire_id.to_string()));
        Ok(())
    }

    async fn publish(&self, url: &str, event: &Event) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .published
            .push((url.to_string(), event.clone()));
        Ok(())
    }

    async fn fetch_events(&self, _relays: &[String], filters: Vec<Filter>, _timeout: Duration) -> Result<Vec<Event>> {
        let kind = filters
            .iter()
            .find_map(|f| f.kinds.as_ref().and_then(|kinds| kinds.iter().next().copied()))
            .map(|k| k.as_u16());
        let delay = {
            let mut log = self.log.lock().unwrap();
            log.fetch_calls += 1;
            log.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let log = self.log.lock().unwrap();
        match kind {
            Some(kind) if log.fetch_failures.contains(&kind) => {
                Err(Error::Timeout(format!("fetch of kind {}", kind)))
            }
            Some(kind) => Ok(log.fetch_results.get(&kind).cloned().unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct GatewayLog {
    sent: Vec<(String, ReplicationWireEvent)>,
    backlog: Vec<ReplicationWireEvent>,
    subscribes: Vec<(String, u64)>,
    hold_open: bool,
    open: Vec<mpsc::Sender<ReplicationWireEvent>>,
}

#[derive(Default)]
pub struct MockGateway {
    log: Mutex<GatewayLog>,
}

impl MockGateway {
    /// Queue a wire that every later gateway subscription replays
    pub fn push(&self, wire: ReplicationWireEvent) {
        self.log.lock().unwrap().backlog.push(wire);
    }

    /// Keep subscription streams open after the backlog (a quiet gateway)
    pub fn hold_open(&self, hold: bool) {
        self.log.lock().unwrap().hold_open = hold;
    }

    pub fn sent(&self) -> Vec<(String, ReplicationWireEvent)> {
        self.log.lock().unwrap().sent.clone()
    }

    /// `(relay_id, since)` per subscription
    pub fn subscribes(&self) -> Vec<(String, u64)> {
        self.log.lock().unwrap().subscribes.clone()
    }
}

#[async_trait]
impl ReplicationGateway for MockGateway {
    async fn send(&self, gateway_url: &str, wire: &ReplicationWireEvent) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .sent
            .push((gateway_url.to_string(), wire.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        _gateway_url: &str,
        relay_id: &str,
        since: u64,
    ) -> Result<mpsc::Receiver<ReplicationWireEvent>> {
        let mut log = self.log.lock().unwrap();
        log.subscribes.push((relay_id.to_string(), since));

        let matching: Vec<ReplicationWireEvent> = log
            .backlog
            .iter()
            .filter(|w| w.relay_id == relay_id && w.created_at > since)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(matching.len().max(1));
        for wire in matching {
            let _ = tx.try_send(wire);
        }
        if log.hold_open {
            log.open.push(tx);
        }
        Ok(rx)
    }
}

#[derive(Default)]
pub struct MockBridge {
    sent: Mutex<Vec<BridgeMessage>>,
}

impl MockBridge {
    pub fn sent(&self) -> Vec<BridgeMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShellBridge for MockBridge {
    async fn send(&self, message: BridgeMessage) -> Result<serde_json::Value> {
        self.sent.lock().unwrap().push(message);
        Ok(serde_json::json!({ "success": true }))
    }
}

pub struct Harness {
    pub client: GroupClient,
    pub keys: Keys,
    pub transport: Arc<MockTransport>,
    pub gateway: Arc<MockGateway>,
    pub bridge: Arc<MockBridge>,
    pub store: Arc<MemoryEventStore>,
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        gateway: GatewaySettings {
            base_url: Some(GATEWAY_BASE.to_string()),
            auth_token: None,
        },
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with_keys(Keys::generate())
}

pub fn harness_with_keys(keys: Keys) -> Harness {
    let transport = Arc::new(MockTransport::default());
    let gateway = Arc::new(MockGateway::default());
    let bridge = Arc::new(MockBridge::default());
    let store = Arc::new(MemoryEventStore::new());

    let client = GroupClient::new(
        test_config(),
        keys.clone(),
        Collaborators {
            transport: transport.clone(),
            gateway: gateway.clone(),
            store: store.clone(),
            bridge: Some(bridge.clone()),
        },
    );
    Harness { client, keys, transport, gateway, bridge, store }
}

/// Make the harness user an admin of `group_id` without any notifications
pub async fn make_admin(h: &Harness, group_id: &str) {
    grant_admin(h, group_id, &h.keys.public_key().to_hex()).await;
}

/// Record `pubkey` as an admin of `group_id` in the harness ledger
pub async fn grant_admin(h: &Harness, group_id: &str, pubkey: &str) {
    let mut state = h.client.state().await;
    state.membership.apply_add(group_id, pubkey, 1, vec!["admin".to_string()]);
    state.membership.recompute(group_id);
}

/// Sign an event at a fixed timestamp
pub fn signed_at(keys: &Keys, kind: u16, content: &str, tags: Vec<Tag>, created_at: u64) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .tags(tags)
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap()
}
