//! Client state.
//!
//! This module contains:
//! - `membership`: add/remove ledgers and the reconciled member view
//! - `group`: metadata, invites, join requests, timelines, relay announcements
//! - `replication`: per-group secret rings and replay cursors
//!
//! [`ClientState`] owns all of it. A `GroupClient` keeps it behind a single
//! async mutex and never holds that lock across network I/O.

pub mod group;
pub mod membership;
pub mod replication;

use nostr_sdk::prelude::*;

use crate::config::ClientConfig;
use crate::relay::connection::RelayConnectionManager;
use crate::services::subscriptions::SubscriptionRouter;

pub use group::{Group, GroupStateStore, Invite, InvitePayload, JoinRequest, RelayAnnouncement, Timeline};
pub use membership::{Member, MembershipReconciler, MergePolicy};
pub use replication::{ReplicationSecret, ReplicationState};

/// Entry of a NIP-65 relay list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayListEntry {
    pub url: String,
    /// `read`, `write`, or `None` for both
    pub marker: Option<String>,
}

/// What the discovery bootstrap learned about the local user
#[derive(Debug, Clone, Default)]
pub struct DiscoveryState {
    pub profile: Option<Event>,
    /// Followed pubkeys (hex)
    pub follows: Vec<String>,
    pub relay_list: Vec<RelayListEntry>,
    /// Newest `created_at` seen per replaceable kind, so stale copies never win
    pub profile_at: u64,
    pub follows_at: u64,
    pub relay_list_at: u64,
    pub ready: bool,
    pub subscriptions_active: bool,
    pub deferred: bool,
    /// A bootstrap was requested while deferred
    pub pending: bool,
}

impl DiscoveryState {
    /// Accept a kind 0 profile if newer than the one held
    pub fn set_profile(&mut self, event: &Event) -> bool {
        let at = event.created_at.as_u64();
        if self.profile.is_some() && at <= self.profile_at {
            return false;
        }
        self.profile = Some(event.clone());
        self.profile_at = at;
        true
    }

    /// Accept a kind 3 follow list if newer than the one held
    pub fn set_follows(&mut self, event: &Event) -> bool {
        let at = event.created_at.as_u64();
        if self.follows_at > 0 && at <= self.follows_at {
            return false;
        }
        self.follows = crate::events::tags_named(event, "p")
            .filter_map(|values| values.get(1))
            .map(|pk| pk.to_lowercase())
            .collect();
        self.follows_at = at;
        true
    }

    /// Accept a kind 10002 relay list if newer than the one held
    pub fn set_relay_list(&mut self, event: &Event) -> bool {
        let at = event.created_at.as_u64();
        if self.relay_list_at > 0 && at <= self.relay_list_at {
            return false;
        }
        self.relay_list = crate::events::tags_named(event, "r")
            .filter_map(|values| {
                let url = values.get(1)?;
                crate::relay::url::validate_relay_url(url).ok().map(|url| RelayListEntry {
                    url,
                    marker: values.get(2).filter(|m| !m.is_empty()).cloned(),
                })
            })
            .collect();
        self.relay_list_at = at;
        true
    }
}

pub struct ClientState {
    pub connections: RelayConnectionManager,
    pub router: SubscriptionRouter,
    pub groups: GroupStateStore,
    pub membership: MembershipReconciler,
    pub replication: ReplicationState,
    pub discovery: DiscoveryState,
}

impl ClientState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            connections: RelayConnectionManager::new(config.retry.clone()),
            router: SubscriptionRouter::new(),
            groups: GroupStateStore::default(),
            membership: MembershipReconciler::new(config.merge_policy),
            replication: ReplicationState::default(),
            discovery: DiscoveryState::default(),
        }
    }

    /// Drop cached group, membership, replication and discovery state
    pub fn clear_cache(&mut self) {
        self.groups.clear();
        self.membership.clear();
        self.replication.clear();
        self.discovery = DiscoveryState::default();
    }
}
