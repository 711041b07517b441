//! Typed notification bus.
//!
//! State changes inside the engine are published as [`Notification`]s. Listeners
//! register per [`Topic`] and receive notifications in registration order. A
//! listener that panics is logged and skipped; the remaining listeners still run.
//! Registration returns a [`ListenerToken`] used to unsubscribe.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr_sdk::prelude::*;
use tracing::warn;

use crate::relay::connection::DeferReason;
use crate::state::membership::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Relay,
    Auth,
    Membership,
    Group,
    Message,
    Invite,
    Replication,
    Discovery,
}

#[derive(Debug, Clone)]
pub enum Notification {
    RelayConnected { identifier: String, url: String },
    RelayFailed { identifier: String, error: String },
    RelayDeferred { identifier: String, reason: DeferReason, delay: Duration },
    /// `auth:failed`: the caller should refresh credentials out of band
    AuthFailed { identifier: String },
    MembersChanged { group_id: String, members: Vec<Member> },
    GroupUpdated { group_id: String },
    GroupRemoved { group_id: String },
    MessageReceived { group_id: String, event: Box<Event> },
    InviteReceived { event_id: String, group_id: String },
    JoinRequested { group_id: String, pubkey: String },
    SecretRegistered { group_id: String, created_at: u64 },
    ReplicationCaughtUp { group_id: String, cursor: u64, ingested: usize },
    BootstrapReady,
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::RelayConnected { .. }
            | Notification::RelayFailed { .. }
            | Notification::RelayDeferred { .. } => Topic::Relay,
            Notification::AuthFailed { .. } => Topic::Auth,
            Notification::MembersChanged { .. } => Topic::Membership,
            Notification::GroupUpdated { .. } | Notification::GroupRemoved { .. } => Topic::Group,
            Notification::MessageReceived { .. } => Topic::Message,
            Notification::InviteReceived { .. } | Notification::JoinRequested { .. } => Topic::Invite,
            Notification::SecretRegistered { .. } | Notification::ReplicationCaughtUp { .. } => {
                Topic::Replication
            }
            Notification::BootstrapReady => Topic::Discovery,
        }
    }
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    topic: Topic,
    id: u64,
}

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<Topic, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> ListenerToken
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.entry(topic).or_default().push((id, Arc::new(listener)));
        ListenerToken { topic, id }
    }

    /// Returns false if the token was already removed
    pub fn unsubscribe(&self, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        match listeners.get_mut(&token.topic) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != token.id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Deliver to every listener of the notification's topic, in registration order.
    /// Returns the number of listeners that completed without panicking.
    pub fn emit(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        // Snapshot so listeners may (un)subscribe without deadlocking
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(&topic)
                .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(&notification))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(topic = ?topic, "notification listener panicked"),
            }
        }
        delivered
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.get(&topic).map(|l| l.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_failed() -> Notification {
        Notification::AuthFailed { identifier: "g1".into() }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            bus.subscribe(Topic::Auth, move |_| seen.lock().unwrap().push(i));
        }
        assert_eq!(bus.emit(auth_failed()), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_siblings() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        bus.subscribe(Topic::Auth, |_| panic!("listener bug"));
        let h = hits.clone();
        bus.subscribe(Topic::Auth, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(auth_failed()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_topics() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let token = bus.subscribe(Topic::Relay, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        // Different topic: not delivered
        bus.emit(auth_failed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(Notification::RelayConnected { identifier: "g1".into(), url: "wss://r1".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        bus.emit(Notification::RelayConnected { identifier: "g1".into(), url: "wss://r1".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(Topic::Relay), 0);
    }
}
