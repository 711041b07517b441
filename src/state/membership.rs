//! Membership reconciliation.
//!
//! Each group keeps two ledgers fed by put-user / remove-user events (and by the
//! relay's member and admin lists):
//!
//! - `adds: pubkey -> { timestamp, roles }`
//! - `removes: pubkey -> timestamp`
//!
//! A pubkey is a current member when it has an add and either no remove or a
//! remove that is not newer than the add. Ties go to the add.
//!
//! Relays may deliver events out of order, so by default a ledger entry is only
//! overwritten by an event with an equal or newer timestamp (`MergePolicy::TimestampMax`).
//! `MergePolicy::ArrivalOrder` keeps the last-arrived write instead.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Keep the write with the greatest timestamp per pubkey
    #[default]
    TimestampMax,
    /// Keep whatever arrived last
    ArrivalOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAdd {
    pub timestamp: u64,
    pub roles: Vec<String>,
}

/// A derived current member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub pubkey: String,
    pub roles: Vec<String>,
}

impl Member {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Per-group add/remove ledgers plus the last derived view
#[derive(Debug, Clone, Default)]
pub struct MembershipLedger {
    adds: HashMap<String, MemberAdd>,
    removes: HashMap<String, u64>,
    /// Last recompute result; `None` until the first recompute
    current: Option<BTreeMap<String, Vec<String>>>,
}

impl MembershipLedger {
    pub fn adds(&self) -> &HashMap<String, MemberAdd> {
        &self.adds
    }

    pub fn removes(&self) -> &HashMap<String, u64> {
        &self.removes
    }

    /// Derive the member set from the ledgers (does not touch the cached view)
    pub fn derive(&self) -> BTreeMap<String, Vec<String>> {
        self.adds
            .iter()
            .filter(|(pubkey, add)| match self.removes.get(*pubkey) {
                Some(removed_at) => *removed_at <= add.timestamp,
                None => true,
            })
            .map(|(pubkey, add)| (pubkey.clone(), add.roles.clone()))
            .collect()
    }

    /// The view produced by the last recompute
    pub fn current(&self) -> Vec<Member> {
        self.current
            .as_ref()
            .map(|m| {
                m.iter()
                    .map(|(pubkey, roles)| Member { pubkey: pubkey.clone(), roles: roles.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.current
            .as_ref()
            .map(|m| m.contains_key(pubkey))
            .unwrap_or(false)
    }

    pub fn roles_of(&self, pubkey: &str) -> Option<&[String]> {
        self.current.as_ref()?.get(pubkey).map(|r| r.as_slice())
    }
}

/// Owns every group's ledger
#[derive(Debug, Default)]
pub struct MembershipReconciler {
    policy: MergePolicy,
    ledgers: HashMap<String, MembershipLedger>,
}

impl MembershipReconciler {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            ledgers: HashMap::new(),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn ledger(&self, group_id: &str) -> Option<&MembershipLedger> {
        self.ledgers.get(group_id)
    }

    fn accepts(&self, stored: Option<u64>, incoming: u64) -> bool {
        match (self.policy, stored) {
            (_, None) => true,
            (MergePolicy::ArrivalOrder, Some(_)) => true,
            (MergePolicy::TimestampMax, Some(stored)) => incoming >= stored,
        }
    }

    /// Record an add. Returns false if an equal-or-newer entry already won.
    pub fn apply_add(&mut self, group_id: &str, pubkey: &str, timestamp: u64, roles: Vec<String>) -> bool {
        let stored = self
            .ledgers
            .get(group_id)
            .and_then(|l| l.adds.get(pubkey))
            .map(|a| a.timestamp);
        if !self.accepts(stored, timestamp) {
            return false;
        }

        let ledger = self.ledgers.entry(group_id.to_string()).or_default();
        ledger.adds.insert(pubkey.to_string(), MemberAdd { timestamp, roles });
        true
    }

    /// Record an add that carries no roles (a relay member list entry). The
    /// timestamp advances like any add, but roles already on record are kept;
    /// `default_roles` only applies to a pubkey without an add.
    pub fn apply_listing(&mut self, group_id: &str, pubkey: &str, timestamp: u64, default_roles: Vec<String>) -> bool {
        let stored = self.ledgers.get(group_id).and_then(|l| l.adds.get(pubkey));
        if !self.accepts(stored.map(|a| a.timestamp), timestamp) {
            return false;
        }
        let roles = match stored {
            Some(add) if !add.roles.is_empty() => add.roles.clone(),
            _ => default_roles,
        };

        let ledger = self.ledgers.entry(group_id.to_string()).or_default();
        ledger.adds.insert(pubkey.to_string(), MemberAdd { timestamp, roles });
        true
    }

    /// Record a remove. Returns false if an equal-or-newer entry already won.
    pub fn apply_remove(&mut self, group_id: &str, pubkey: &str, timestamp: u64) -> bool {
        let stored = self
            .ledgers
            .get(group_id)
            .and_then(|l| l.removes.get(pubkey))
            .copied();
        if !self.accepts(stored, timestamp) {
            return false;
        }

        let ledger = self.ledgers.entry(group_id.to_string()).or_default();
        ledger.removes.insert(pubkey.to_string(), timestamp);
        true
    }

    /// Re-derive the group's membership.
    ///
    /// Returns `Some(members)` only if the derived set (pubkeys or roles) differs
    /// from the previous recompute, so callers notify listeners exactly once per change.
    pub fn recompute(&mut self, group_id: &str) -> Option<Vec<Member>> {
        let ledger = self.ledgers.get_mut(group_id)?;
        let derived = ledger.derive();

        if ledger.current.as_ref() == Some(&derived) {
            return None;
        }
        ledger.current = Some(derived);
        Some(ledger.current())
    }

    pub fn members(&self, group_id: &str) -> Vec<Member> {
        self.ledgers.get(group_id).map(|l| l.current()).unwrap_or_default()
    }

    pub fn is_member(&self, group_id: &str, pubkey: &str) -> bool {
        self.ledgers
            .get(group_id)
            .map(|l| l.is_member(pubkey))
            .unwrap_or(false)
    }

    pub fn has_role(&self, group_id: &str, pubkey: &str, role: &str) -> bool {
        self.ledgers
            .get(group_id)
            .and_then(|l| l.roles_of(pubkey))
            .map(|roles| roles.iter().any(|r| r.eq_ignore_ascii_case(role)))
            .unwrap_or(false)
    }

    /// Drop a group's ledgers entirely (leave / delete)
    pub fn forget(&mut self, group_id: &str) {
        self.ledgers.remove(group_id);
    }

    pub fn clear(&mut self) {
        self.ledgers.clear();
    }
}
