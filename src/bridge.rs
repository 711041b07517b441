//! Messages to the shell/worker process that hosts the group relays.
//!
//! The worker needs to know who may access each relay. Membership changes and
//! auth tokens are pushed to it as tagged JSON messages; responses are opaque.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::membership::MembershipLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddEntry {
    pub pubkey: String,
    pub ts: u64,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRemoveEntry {
    pub pubkey: String,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeMessage {
    UpdateAuthData {
        #[serde(rename = "relayKey")]
        relay_key: Option<String>,
        #[serde(rename = "publicIdentifier")]
        public_identifier: String,
        pubkey: String,
        token: String,
    },
    RemoveAuthData {
        #[serde(rename = "relayKey")]
        relay_key: Option<String>,
        #[serde(rename = "publicIdentifier")]
        public_identifier: String,
        pubkey: String,
    },
    UpdateMembers {
        #[serde(rename = "relayKey")]
        relay_key: Option<String>,
        #[serde(rename = "publicIdentifier")]
        public_identifier: String,
        members: Vec<String>,
        member_adds: Vec<MemberAddEntry>,
        member_removes: Vec<MemberRemoveEntry>,
    },
}

impl BridgeMessage {
    /// Full membership snapshot for the worker, ledgers included so it can
    /// apply the same reconciliation rule.
    pub fn update_members(relay_key: Option<String>, public_identifier: &str, ledger: &MembershipLedger) -> Self {
        let members = ledger.current().into_iter().map(|m| m.pubkey).collect();

        let mut member_adds: Vec<MemberAddEntry> = ledger
            .adds()
            .iter()
            .map(|(pubkey, add)| MemberAddEntry {
                pubkey: pubkey.clone(),
                ts: add.timestamp,
                roles: add.roles.clone(),
            })
            .collect();
        member_adds.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        let mut member_removes: Vec<MemberRemoveEntry> = ledger
            .removes()
            .iter()
            .map(|(pubkey, ts)| MemberRemoveEntry { pubkey: pubkey.clone(), ts: *ts })
            .collect();
        member_removes.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        BridgeMessage::UpdateMembers {
            relay_key,
            public_identifier: public_identifier.to_string(),
            members,
            member_adds,
            member_removes,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::UpdateAuthData { .. } => "update-auth-data",
            BridgeMessage::RemoveAuthData { .. } => "remove-auth-data",
            BridgeMessage::UpdateMembers { .. } => "update-members",
        }
    }
}

#[async_trait]
pub trait ShellBridge: Send + Sync {
    async fn send(&self, message: BridgeMessage) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::membership::{MergePolicy, MembershipReconciler};

    #[test]
    fn test_tagged_json_shape() {
        let msg = BridgeMessage::UpdateAuthData {
            relay_key: Some("rk".into()),
            public_identifier: "g1".into(),
            pubkey: "pk".into(),
            token: "tok".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "update-auth-data");
        assert_eq!(json["relayKey"], "rk");
        assert_eq!(json["publicIdentifier"], "g1");
        assert_eq!(msg.kind(), "update-auth-data");
    }

    #[test]
    fn test_update_members_from_ledger() {
        let mut reconciler = MembershipReconciler::new(MergePolicy::TimestampMax);
        reconciler.apply_add("g1", "alice", 10, vec!["admin".into()]);
        reconciler.apply_add("g1", "bob", 10, vec![]);
        reconciler.apply_remove("g1", "bob", 20);
        reconciler.recompute("g1");

        let msg = BridgeMessage::update_members(None, "g1", reconciler.ledger("g1").unwrap());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "update-members");
        assert_eq!(json["members"], serde_json::json!(["alice"]));
        assert_eq!(json["member_adds"].as_array().unwrap().len(), 2);
        assert_eq!(json["member_removes"][0]["pubkey"], "bob");
        assert_eq!(json["member_removes"][0]["ts"], 20);
    }
}
