//! Group lifecycle and moderation actions.
//!
//! This module handles:
//! - Creating, editing and deleting groups
//! - Adding and removing members
//! - Sending messages (with replication when enabled)
//! - Leaving a group and dropping everything cached for it

use nostr_sdk::prelude::*;
use rand::Rng;
use tracing::{info, warn};

use crate::bridge::BridgeMessage;
use crate::client::GroupClient;
use crate::commands::{ADMIN_ROLE, LOCAL_SOURCE};
use crate::error::{Error, Result};
use crate::events::{tag, event_kind};
use crate::services::notifications::Notification;
use crate::shared::ResultExt;
use crate::state::Group;
use crate::util::{bytes_to_hex_string, now_secs};

#[derive(Debug, Clone, Default)]
pub struct CreateGroupParams {
    pub name: String,
    pub about: String,
    pub is_public: bool,
    pub is_open: bool,
    pub file_sharing: bool,
    pub encrypted_replication: bool,
    /// Relay hosting the group. Required: group events only go to the group's relay.
    pub relay_url: Option<String>,
}

/// Random public identifier for a new group
fn generate_group_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes_to_hex_string(&bytes)
}

fn member_tag(pubkey: &PublicKey, roles: &[String]) -> Tag {
    let mut values = vec![pubkey.to_hex()];
    values.extend(roles.iter().cloned());
    tag("p", values)
}

// ============================================================================
// Group lifecycle
// ============================================================================

impl GroupClient {
    /// Create a group with us as its only admin.
    pub async fn create_group(&self, params: CreateGroupParams) -> Result<Group> {
        self.ensure_active()?;
        let group_id = generate_group_id();
        let created_at = now_secs();

        let mut group = Group::new(&group_id, params.name, created_at);
        group.about = params.about;
        group.is_public = params.is_public;
        group.is_open = params.is_open;
        group.file_sharing = params.file_sharing;
        group.encrypted_replication = params.encrypted_replication;

        let url = params
            .relay_url
            .as_deref()
            .ok_or_else(|| Error::Precondition("A relay URL is required to create a group".into()))?;
        self.connect_now(&group_id, url).await?;
        let event = self.sign(event_kind::GROUP_CREATE, "", group.metadata_tags())?;
        self.publish_to_group(&group_id, &event).await?;

        {
            let mut state = self.state().await;
            state.groups.apply_metadata(group.clone());
            state
                .membership
                .apply_add(&group_id, &self.my_pubkey_hex(), created_at, vec![ADMIN_ROLE.to_string()]);
        }
        self.recompute_membership(&group_id).await;
        info!(group_id = %group_id, "group created");
        self.emit(Notification::GroupUpdated { group_id: group_id.clone() });

        if group.encrypted_replication {
            // No other members yet: this only seeds our own ring
            self.distribute_secret(&group_id, &[]).await?;
        }
        Ok(group)
    }

    /// Publish new metadata for a group we administer.
    pub async fn edit_group(&self, mut group: Group) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(&group.id).await?;

        let previous = self.state().await.groups.group(&group.id).map(|g| g.created_at);
        // Metadata only replaces strictly older metadata
        group.created_at = now_secs().max(previous.map_or(0, |at| at + 1));

        let event = EventBuilder::new(Kind::from(event_kind::GROUP_EDIT_METADATA), "")
            .tags(group.metadata_tags())
            .custom_created_at(Timestamp::from_secs(group.created_at))
            .sign_with_keys(&self.inner.keys)
            .context(Error::Nostr, "Failed to sign metadata edit")?;
        self.publish_to_group(&group.id, &event).await?;

        let group_id = group.id.clone();
        if self.state().await.groups.apply_metadata(group) {
            self.emit(Notification::GroupUpdated { group_id });
        }
        Ok(event)
    }

    /// Delete a group we administer. Local state goes through the same path
    /// as a delete received from the relay.
    pub async fn delete_group(&self, group_id: &str) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let event = self.sign(event_kind::GROUP_DELETE, "", vec![tag("h", [group_id])])?;
        self.publish_to_group(group_id, &event).await?;
        self.process_event(&event, LOCAL_SOURCE).await?;
        self.inner.store.clear(group_id).await?;
        Ok(event)
    }

    /// Leave a group: best-effort leave request, then drop subscriptions, the
    /// relay connection, cached events and every piece of group state.
    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        self.ensure_active()?;

        match self.sign(event_kind::GROUP_LEAVE_REQUEST, "", vec![tag("h", [group_id])]) {
            Ok(event) => {
                if let Err(e) = self.publish_to_group(group_id, &event).await {
                    warn!(group_id, error = %e, "leave request not delivered");
                }
            }
            Err(e) => warn!(group_id, error = %e, "leave request not signed"),
        }

        self.unsubscribe_group(group_id).await?;
        let (url, relay_key) = {
            let mut state = self.state().await;
            let relay_key = state
                .connections
                .relay_key_for(group_id)
                .or_else(|| state.groups.group(group_id).and_then(|g| g.relay_key.clone()));
            let url = state
                .connections
                .remove(group_id)
                .and_then(|conn| conn.url);
            state.groups.remove_group(group_id);
            state.membership.forget(group_id);
            state.replication.forget(group_id);
            (url, relay_key)
        };
        let key = group_id.to_string();
        self.inner.retry_slots.cancel(&key);
        self.inner.debounce_slots.cancel(&key);

        if let Some(url) = url {
            if let Err(e) = self.inner.transport.disconnect(&url).await {
                warn!(group_id, error = %e, "disconnect failed");
            }
        }
        self.inner.store.clear(group_id).await?;
        self.bridge_send(BridgeMessage::RemoveAuthData {
            relay_key,
            public_identifier: group_id.to_string(),
            pubkey: self.my_pubkey_hex(),
        })
        .await;

        info!(group_id, "left group");
        self.emit(Notification::GroupRemoved { group_id: group_id.to_string() });
        Ok(())
    }
}

// ============================================================================
// Members and messages
// ============================================================================

impl GroupClient {
    /// Put a user into a group (kind 9000). Roles default to `member`.
    pub async fn add_member(&self, group_id: &str, pubkey: &PublicKey, roles: Vec<String>) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let event = self.sign(
            event_kind::GROUP_PUT_USER,
            "",
            vec![tag("h", [group_id]), member_tag(pubkey, &roles)],
        )?;
        self.publish_to_group(group_id, &event).await?;
        self.process_event(&event, LOCAL_SOURCE).await?;
        Ok(event)
    }

    /// Remove a user from a group (kind 9001).
    pub async fn remove_member(&self, group_id: &str, pubkey: &PublicKey) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let event = self.sign(
            event_kind::GROUP_REMOVE_USER,
            "",
            vec![tag("h", [group_id]), member_tag(pubkey, &[])],
        )?;
        self.publish_to_group(group_id, &event).await?;
        self.process_event(&event, LOCAL_SOURCE).await?;
        Ok(event)
    }

    /// Send a chat message. It lands on our own timeline and in the cache
    /// right away, and is mirrored to the gateway when the group replicates.
    pub async fn send_message(&self, group_id: &str, content: &str) -> Result<Event> {
        self.ensure_active()?;
        self.require_member(group_id).await?;

        let event = self.sign(event_kind::CHAT_MESSAGE, content, vec![tag("h", [group_id])])?;
        self.publish_to_group(group_id, &event).await?;

        self.state().await.groups.push_message(group_id, event.clone());
        self.inner.store.put(group_id, &event).await?;
        if let Err(e) = self.publish_replica(&event, group_id).await {
            warn!(group_id, event_id = %event.id, error = %e, "replica not mirrored");
        }
        self.emit(Notification::MessageReceived {
            group_id: group_id.to_string(),
            event: Box::new(event.clone()),
        });
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::ConnectionStatus;
    use crate::services::replication::open_wire;
    use crate::state::InvitePayload;
    use crate::store::{EventQuery, EventStore};
    use crate::testing::{harness, make_admin};

    #[tokio::test(start_paused = true)]
    async fn test_create_group_makes_us_admin() {
        let h = harness();
        let params = CreateGroupParams {
            name: "Hikers".into(),
            is_public: true,
            is_open: false,
            encrypted_replication: true,
            relay_url: Some("wss://r1".into()),
            ..Default::default()
        };
        let group = h.client.create_group(params).await.unwrap();
        assert_eq!(group.id.len(), 16);
        assert!(!group.is_open);

        let published = h.transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.kind.as_u16(), event_kind::GROUP_CREATE);

        let members = h.client.members(&group.id).await;
        assert_eq!(members.len(), 1);
        assert!(members[0].has_role(ADMIN_ROLE));
        // Replicated groups start with a secret of their own
        assert!(h.client.state().await.replication.newest_secret(&group.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_group_without_relay_fails() {
        let h = harness();
        // Another group's live relay is not a fallback
        h.client.connect_now("g2", "wss://r2").await.unwrap();
        let err = h.client.create_group(CreateGroupParams::default()).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(h.transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_events_never_reach_other_groups_relays() {
        let h = harness();
        make_admin(&h, "g1").await;
        h.client.connect_now("g2", "wss://r2").await.unwrap();

        let err = h.client.send_message("g1", "private").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let err = h
            .client
            .create_invite("g1", &Keys::generate().public_key(), InvitePayload {
                relay_url: "wss://r1".into(),
                token: None,
                relay_key: None,
                is_public: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(h.transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_actions_require_admin() {
        let h = harness();
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        let bob = Keys::generate().public_key();

        let err = h.client.add_member("g1", &bob, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(h.transport.published().is_empty());

        make_admin(&h, "g1").await;
        h.client.add_member("g1", &bob, vec![]).await.unwrap();
        assert!(h.client.members("g1").await.iter().any(|m| m.pubkey == bob.to_hex()));

        h.client.remove_member("g1", &bob).await.unwrap();
        assert!(!h.client.members("g1").await.iter().any(|m| m.pubkey == bob.to_hex()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_is_cached_and_mirrored() {
        let h = harness();
        make_admin(&h, "g1").await;
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        let mut group = Group::new("g1", "Replicated", 1);
        group.encrypted_replication = true;
        h.client.state().await.groups.apply_metadata(group);
        h.client.distribute_secret("g1", &[]).await.unwrap();

        let event = h.client.send_message("g1", "hello").await.unwrap();
        assert_eq!(h.client.timeline("g1").await, vec![event.clone()]);
        assert_eq!(h.store.query("g1", &EventQuery::default()).await.unwrap(), vec![event.clone()]);

        let key = h.client.state().await.replication.newest_secret("g1").unwrap().key.clone();
        let sent = h.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(open_wire(&sent[0].1, &key).unwrap(), event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_member_cannot_send() {
        let h = harness();
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        let err = h.client.send_message("g1", "hi").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_group_drops_everything() {
        let h = harness();
        make_admin(&h, "g1").await;
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        h.client.send_message("g1", "bye soon").await.unwrap();

        h.client.leave_group("g1").await.unwrap();
        assert_eq!(h.client.connection_status("g1").await, None);
        assert!(h.client.members("g1").await.is_empty());
        assert!(h.client.timeline("g1").await.is_empty());
        assert!(h.store.query("g1", &EventQuery::default()).await.unwrap().is_empty());
        assert_eq!(h.transport.disconnects(), vec!["wss://r1".to_string()]);

        let published = h.transport.published();
        assert_eq!(published.last().unwrap().1.kind.as_u16(), event_kind::GROUP_LEAVE_REQUEST);
        assert!(h
            .bridge
            .sent()
            .iter()
            .any(|m| matches!(m, BridgeMessage::RemoveAuthData { public_identifier, .. } if public_identifier == "g1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_group_clears_local_state() {
        let h = harness();
        make_admin(&h, "g1").await;
        h.client.connect_now("g1", "wss://r1").await.unwrap();
        h.client.state().await.groups.apply_metadata(Group::new("g1", "Doomed", 1));

        h.client.delete_group("g1").await.unwrap();
        assert!(h.client.group("g1").await.is_none());
        assert!(h.client.members("g1").await.is_empty());
        // The relay connection itself is left to the caller
        assert_eq!(h.client.connection_status("g1").await, Some(ConnectionStatus::Connected));
    }
}
