//! Subscription routing.
//!
//! Logical subscribers register filters under their own id. Subscribers whose
//! filter lists hash equal and whose options match (target relays, group,
//! global-listener suppression) share one network subscription, which bounds the
//! number of REQs a relay sees when the same filters are requested repeatedly.
//! The network subscription is closed when its last logical subscriber leaves.
//!
//! Relays see a short wire id; incoming events are routed back through the
//! wire-id map. Handlers for one event run in registration order, then global
//! listeners run unless the subscription suppresses them. A handler that errors
//! or panics is logged and skipped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use nostr_sdk::prelude::*;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::sha256_hex;

/// Handler invoked with the event and the URL of the relay it came from
pub type EventHandler = Arc<dyn Fn(&Event, &str) -> Result<()> + Send + Sync>;

/// Longest wire id we hand to relays; many relays reject ids over 64 chars
const MAX_WIRE_ID_LEN: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Relays to subscribe on; empty means every connected relay
    pub target_relays: Vec<String>,
    /// Skip global listeners for events from this subscription
    pub suppress_global_events: bool,
    /// Group this subscription belongs to (re-sent when the group's relay connects)
    pub group_id: Option<String>,
}

/// What the transport must open or close
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSubscription {
    pub wire_id: String,
    pub filters: Vec<Filter>,
    pub target_relays: Vec<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// A new network subscription must be opened
    Opened(NetworkSubscription),
    /// An identical subscription already exists; the handler was attached to it
    Reused { wire_id: String },
}

struct Subscription {
    wire_id: String,
    filters: Vec<Filter>,
    target_relays: Vec<String>,
    group_id: Option<String>,
    suppress_global_events: bool,
    hash: String,
    /// (logical subscriber id, handler) in registration order
    handlers: Vec<(String, EventHandler)>,
}

impl Subscription {
    fn network(&self) -> NetworkSubscription {
        NetworkSubscription {
            wire_id: self.wire_id.clone(),
            filters: self.filters.clone(),
            target_relays: self.target_relays.clone(),
            group_id: self.group_id.clone(),
        }
    }
}

/// Handlers resolved for one incoming event, invoked outside any lock
pub struct Delivery {
    handlers: Vec<EventHandler>,
    globals: Vec<EventHandler>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl Delivery {
    pub fn deliver(self, event: &Event, relay: &str) -> DispatchReport {
        let mut report = DispatchReport::default();
        for handler in self.handlers.iter().chain(self.globals.iter()) {
            match catch_unwind(AssertUnwindSafe(|| handler(event, relay))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(event_id = %event.id, relay, error = %e, "subscription handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(event_id = %event.id, relay, "subscription handler panicked");
                }
            }
        }
        report
    }
}

#[derive(Default)]
pub struct SubscriptionRouter {
    /// wire id -> subscription
    subscriptions: HashMap<String, Subscription>,
    /// sharing key -> wire id
    by_hash: HashMap<String, String>,
    /// logical subscriber id -> wire id
    logical: HashMap<String, String>,
    global: Vec<(u64, EventHandler)>,
    next_global: u64,
}

/// Recursively sort object keys so structurally equal filters serialize identically.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Dedup key: SHA-256 of the canonical JSON of the filter list (filter order kept)
pub fn filters_hash(filters: &[Filter]) -> Result<String> {
    let value = canonicalize(serde_json::to_value(filters)?);
    Ok(sha256_hex(serde_json::to_string(&value)?.as_bytes()))
}

/// Sharing key: the filter hash plus everything that decides where the
/// subscription is opened and how its events are delivered. Subscribers with
/// a different scope get their own network subscription.
fn sharing_key(filters: &[Filter], opts: &SubscribeOptions) -> Result<String> {
    let mut targets = opts.target_relays.clone();
    targets.sort();
    targets.dedup();
    let scope = serde_json::json!({
        "filters": filters_hash(filters)?,
        "group": opts.group_id,
        "suppress": opts.suppress_global_events,
        "targets": targets,
    });
    Ok(sha256_hex(serde_json::to_string(&scope)?.as_bytes()))
}

fn wire_id_for(id: &str) -> String {
    if id.len() <= MAX_WIRE_ID_LEN {
        id.to_string()
    } else {
        format!("sub-{}", &sha256_hex(id.as_bytes())[..16])
    }
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        id: &str,
        filters: Vec<Filter>,
        handler: EventHandler,
        opts: SubscribeOptions,
    ) -> Result<SubscribeOutcome> {
        if self.logical.contains_key(id) {
            return Err(Error::Precondition(format!("subscription id {} already in use", id)));
        }

        let hash = sharing_key(&filters, &opts)?;
        if let Some(wire_id) = self.by_hash.get(&hash).cloned() {
            if let Some(existing) = self.subscriptions.get_mut(&wire_id) {
                debug!(id, wire_id = %wire_id, "reusing identical subscription");
                existing.handlers.push((id.to_string(), handler));
                self.logical.insert(id.to_string(), wire_id.clone());
                return Ok(SubscribeOutcome::Reused { wire_id });
            }
        }

        let mut wire_id = wire_id_for(id);
        // Another logical id may already own this wire id
        let mut n = 1;
        while self.subscriptions.contains_key(&wire_id) {
            wire_id = format!("{}-{}", wire_id_for(id).chars().take(MAX_WIRE_ID_LEN - 4).collect::<String>(), n);
            n += 1;
        }

        let sub = Subscription {
            wire_id: wire_id.clone(),
            filters,
            target_relays: opts.target_relays,
            group_id: opts.group_id,
            suppress_global_events: opts.suppress_global_events,
            hash: hash.clone(),
            handlers: vec![(id.to_string(), handler)],
        };
        let network = sub.network();

        self.subscriptions.insert(wire_id.clone(), sub);
        self.by_hash.insert(hash, wire_id.clone());
        self.logical.insert(id.to_string(), wire_id);
        Ok(SubscribeOutcome::Opened(network))
    }

    /// Resolve the handlers for an event received on `sub_id` (wire id or logical id).
    pub fn resolve(&self, sub_id: &str) -> Option<Delivery> {
        let wire_id = if self.subscriptions.contains_key(sub_id) {
            sub_id
        } else {
            self.logical.get(sub_id)?.as_str()
        };
        let sub = self.subscriptions.get(wire_id)?;

        let globals = if sub.suppress_global_events {
            Vec::new()
        } else {
            self.global.iter().map(|(_, h)| h.clone()).collect()
        };
        Some(Delivery {
            handlers: sub.handlers.iter().map(|(_, h)| h.clone()).collect(),
            globals,
        })
    }

    /// Resolve and deliver in one step. Unknown subscriptions deliver nothing.
    pub fn dispatch(&self, sub_id: &str, event: &Event, relay: &str) -> DispatchReport {
        match self.resolve(sub_id) {
            Some(delivery) => delivery.deliver(event, relay),
            None => {
                debug!(sub_id, event_id = %event.id, "event for unknown subscription");
                DispatchReport::default()
            }
        }
    }

    /// Remove a logical subscriber. Returns the network subscription to close
    /// when it was the last subscriber sharing it.
    pub fn unsubscribe(&mut self, id: &str) -> Option<NetworkSubscription> {
        let wire_id = self.logical.remove(id)?;
        let sub = self.subscriptions.get_mut(&wire_id)?;
        sub.handlers.retain(|(owner, _)| owner != id);
        if !sub.handlers.is_empty() {
            return None;
        }

        let sub = self.subscriptions.remove(&wire_id)?;
        self.by_hash.remove(&sub.hash);
        Some(sub.network())
    }

    /// Remove every logical subscriber attached to a group's subscriptions.
    pub fn unsubscribe_group(&mut self, group_id: &str) -> Vec<NetworkSubscription> {
        let mut ids: Vec<String> = self
            .logical
            .iter()
            .filter(|(_, wire_id)| {
                self.subscriptions
                    .get(*wire_id)
                    .map(|s| s.group_id.as_deref() == Some(group_id))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        ids.iter().filter_map(|id| self.unsubscribe(id)).collect()
    }

    /// Network subscriptions scoped to a group
    pub fn group_subscriptions(&self, group_id: &str) -> Vec<NetworkSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.group_id.as_deref() == Some(group_id))
            .map(|s| s.network())
            .collect()
    }

    /// Subscriptions that should be opened on any connected relay
    pub fn unscoped_subscriptions(&self) -> Vec<NetworkSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.group_id.is_none())
            .map(|s| s.network())
            .collect()
    }

    pub fn add_global_listener(&mut self, handler: EventHandler) -> u64 {
        let id = self.next_global;
        self.next_global += 1;
        self.global.push((id, handler));
        id
    }

    pub fn remove_global_listener(&mut self, id: u64) -> bool {
        let before = self.global.len();
        self.global.retain(|(gid, _)| *gid != id);
        before != self.global.len()
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.logical.contains_key(id)
    }

    /// Number of network subscriptions (not logical subscribers)
    pub fn network_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drop all bookkeeping, returning every open network subscription
    pub fn clear(&mut self) -> Vec<NetworkSubscription> {
        let open = self.subscriptions.values().map(|s| s.network()).collect();
        self.subscriptions.clear();
        self.by_hash.clear();
        self.logical.clear();
        self.global.clear();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> Event {
        EventBuilder::new(Kind::from(9), "hello")
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> EventHandler {
        let log = log.clone();
        let name = name.to_string();
        Arc::new(move |_, _| {
            log.lock().unwrap().push(name.clone());
            Ok(())
        })
    }

    fn group_filter(group: &str) -> Filter {
        Filter::new()
            .kind(Kind::from(9))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), group)
    }

    #[test]
    fn test_identical_filters_share_one_subscription() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Same filter built in a different order
        let a = Filter::new().kind(Kind::from(9)).limit(50).since(Timestamp::from_secs(10));
        let b = Filter::new().since(Timestamp::from_secs(10)).limit(50).kind(Kind::from(9));

        let first = router.subscribe("one", vec![a], recorder(&log, "one"), SubscribeOptions::default()).unwrap();
        let second = router.subscribe("two", vec![b], recorder(&log, "two"), SubscribeOptions::default()).unwrap();

        let wire_id = match first {
            SubscribeOutcome::Opened(net) => net.wire_id,
            other => panic!("expected open, got {:?}", other),
        };
        assert_eq!(second, SubscribeOutcome::Reused { wire_id: wire_id.clone() });
        assert_eq!(router.network_count(), 1);

        router.dispatch(&wire_id, &event(), "wss://r1");
        assert_eq!(*log.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_different_scope_is_not_shared() {
        let mut router = SubscriptionRouter::new();
        let noop: EventHandler = Arc::new(|_, _| Ok(()));
        let on = |relay: &str| SubscribeOptions { target_relays: vec![relay.to_string()], ..Default::default() };

        router.subscribe("a", vec![group_filter("g1")], noop.clone(), on("wss://r1")).unwrap();
        let other_relay = router.subscribe("b", vec![group_filter("g1")], noop.clone(), on("wss://r2")).unwrap();
        match other_relay {
            SubscribeOutcome::Opened(net) => assert_eq!(net.target_relays, vec!["wss://r2".to_string()]),
            other => panic!("expected open, got {:?}", other),
        }

        let scoped = SubscribeOptions { group_id: Some("g1".into()), ..on("wss://r1") };
        assert!(matches!(
            router.subscribe("c", vec![group_filter("g1")], noop.clone(), scoped).unwrap(),
            SubscribeOutcome::Opened(_)
        ));
        let quiet = SubscribeOptions { suppress_global_events: true, ..on("wss://r1") };
        assert!(matches!(
            router.subscribe("d", vec![group_filter("g1")], noop.clone(), quiet).unwrap(),
            SubscribeOutcome::Opened(_)
        ));
        assert_eq!(router.network_count(), 4);

        // Same scope, targets listed in another order: shared
        let both = |a: &str, b: &str| SubscribeOptions {
            target_relays: vec![a.to_string(), b.to_string()],
            ..Default::default()
        };
        router.subscribe("e", vec![group_filter("g1")], noop.clone(), both("wss://r1", "wss://r2")).unwrap();
        assert!(matches!(
            router.subscribe("f", vec![group_filter("g1")], noop, both("wss://r2", "wss://r1")).unwrap(),
            SubscribeOutcome::Reused { .. }
        ));

        // A group-scoped subscriber is always found by its group
        assert_eq!(router.unsubscribe_group("g1").len(), 1);
        assert!(!router.is_subscribed("c"));
    }

    #[test]
    fn test_filter_order_matters() {
        let f1 = Filter::new().kind(Kind::from(1));
        let f2 = Filter::new().kind(Kind::from(9));
        assert_ne!(
            filters_hash(&[f1.clone(), f2.clone()]).unwrap(),
            filters_hash(&[f2, f1]).unwrap()
        );
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: EventHandler = Arc::new(|_, _| Err(Error::Precondition("bad".into())));
        let panicking: EventHandler = Arc::new(|_, _| panic!("handler bug"));

        router.subscribe("a", vec![group_filter("g1")], failing, SubscribeOptions::default()).unwrap();
        router.subscribe("b", vec![group_filter("g1")], panicking, SubscribeOptions::default()).unwrap();
        router.subscribe("c", vec![group_filter("g1")], recorder(&log, "c"), SubscribeOptions::default()).unwrap();

        let report = router.dispatch("a", &event(), "wss://r1");
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_global_listeners_and_suppression() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.add_global_listener(recorder(&log, "global"));

        router.subscribe("loud", vec![group_filter("g1")], recorder(&log, "loud"), SubscribeOptions::default()).unwrap();
        router
            .subscribe(
                "quiet",
                vec![group_filter("g2")],
                recorder(&log, "quiet"),
                SubscribeOptions { suppress_global_events: true, ..Default::default() },
            )
            .unwrap();

        router.dispatch("loud", &event(), "wss://r1");
        router.dispatch("quiet", &event(), "wss://r1");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["loud".to_string(), "global".to_string(), "quiet".to_string()]
        );
    }

    #[test]
    fn test_long_ids_get_short_wire_ids() {
        let mut router = SubscriptionRouter::new();
        let long_id = "group-messages-".repeat(10);
        let outcome = router
            .subscribe(&long_id, vec![group_filter("g1")], Arc::new(|_, _| Ok(())), SubscribeOptions::default())
            .unwrap();
        let wire_id = match outcome {
            SubscribeOutcome::Opened(net) => net.wire_id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(wire_id.len() <= MAX_WIRE_ID_LEN);
        // Both the wire id and the logical id resolve
        assert!(router.resolve(&wire_id).is_some());
        assert!(router.resolve(&long_id).is_some());
        assert!(router.resolve("unknown").is_none());
    }

    #[test]
    fn test_shared_subscription_closes_with_last_subscriber() {
        let mut router = SubscriptionRouter::new();
        let noop: EventHandler = Arc::new(|_, _| Ok(()));
        router.subscribe("a", vec![group_filter("g1")], noop.clone(), SubscribeOptions::default()).unwrap();
        router.subscribe("b", vec![group_filter("g1")], noop, SubscribeOptions::default()).unwrap();

        assert!(router.unsubscribe("a").is_none());
        assert!(!router.is_subscribed("a"));
        assert!(router.is_subscribed("b"));
        let closed = router.unsubscribe("b").unwrap();
        assert_eq!(closed.wire_id, "a");
        assert_eq!(router.network_count(), 0);
        assert!(router.unsubscribe("b").is_none());
    }

    #[test]
    fn test_unsubscribe_group() {
        let mut router = SubscriptionRouter::new();
        let noop: EventHandler = Arc::new(|_, _| Ok(()));
        let scoped = |g: &str| SubscribeOptions { group_id: Some(g.to_string()), ..Default::default() };

        router.subscribe("g1-msgs", vec![group_filter("g1")], noop.clone(), scoped("g1")).unwrap();
        router
            .subscribe("g1-meta", vec![Filter::new().kind(Kind::from(39000))], noop.clone(), scoped("g1"))
            .unwrap();
        router.subscribe("g2-msgs", vec![group_filter("g2")], noop, scoped("g2")).unwrap();

        assert_eq!(router.group_subscriptions("g1").len(), 2);
        let closed = router.unsubscribe_group("g1");
        assert_eq!(closed.len(), 2);
        assert_eq!(router.network_count(), 1);
        assert!(router.is_subscribed("g2-msgs"));
    }

    #[test]
    fn test_duplicate_logical_id_rejected() {
        let mut router = SubscriptionRouter::new();
        let noop: EventHandler = Arc::new(|_, _| Ok(()));
        router.subscribe("a", vec![group_filter("g1")], noop.clone(), SubscribeOptions::default()).unwrap();
        assert!(matches!(
            router.subscribe("a", vec![group_filter("g2")], noop, SubscribeOptions::default()),
            Err(Error::Precondition(_))
        ));
    }
}
