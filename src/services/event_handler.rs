//! Event handler service for processing incoming group events.
//!
//! This module handles:
//! - Group metadata, admin and member lists (kinds 39000-39002)
//! - Moderation actions: put-user, remove-user, delete-group, leave requests
//! - Join requests and invites addressed to us
//! - Chat messages and text notes on group timelines
//! - Replication secrets handed to us directly
//! - Our own profile, follow list and relay list, and relay announcements
//!
//! Every event that reaches a known subscription passes through
//! [`GroupClient::process_event`] before subscription handlers run.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::GroupClient;
use crate::commands::ADMIN_ROLE;
use crate::crypto;
use crate::error::{Error, Result};
use crate::events::{self, event_kind};
use crate::services::notifications::Notification;
use crate::state::group::{parse_announcement, Group, Invite, InvitePayload, JoinRequest};
use crate::util;

/// Role given to members listed without an explicit role
pub const DEFAULT_ROLE: &str = "member";

/// How far ahead of our clock a secret's timestamp may be
pub const MAX_SECRET_CLOCK_SKEW_SECS: u64 = 600;

/// NIP-44 sealed content of a secret-distribution event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPayload {
    pub group_id: String,
    /// 32-byte replication secret, hex
    pub secret: String,
}

fn roles_or_default(roles: Vec<String>) -> Vec<String> {
    if roles.is_empty() {
        vec![DEFAULT_ROLE.to_string()]
    } else {
        roles
    }
}

impl GroupClient {
    /// Route one event by kind into group state. Returns an error for events
    /// that are malformed or cannot be decrypted; callers log and move on.
    pub(crate) async fn process_event(&self, event: &Event, relay: &str) -> Result<()> {
        self.ensure_active()?;
        let kind = events::kind_of(event);

        match kind {
            event_kind::GROUP_METADATA => self.handle_metadata(event).await,
            event_kind::GROUP_ADMIN_LIST | event_kind::GROUP_MEMBER_LIST => self.handle_member_list(event).await,
            event_kind::GROUP_PUT_USER => self.handle_put_user(event).await,
            event_kind::GROUP_REMOVE_USER => self.handle_remove_user(event).await,
            event_kind::GROUP_LEAVE_REQUEST => self.handle_leave_request(event).await,
            event_kind::GROUP_DELETE => self.handle_group_delete(event).await,
            event_kind::GROUP_JOIN_REQUEST => self.handle_join_request(event).await,
            event_kind::GROUP_INVITE_CREATE => self.handle_invite(event).await,
            event_kind::SECRET_DISTRIBUTION => self.handle_secret(event).await.map(|_| ()),
            event_kind::HYPERTUNA_RELAY_ANNOUNCE => self.handle_announcement(event).await,
            event_kind::PROFILE | event_kind::FOLLOW_LIST | event_kind::USER_RELAY_LIST => {
                self.handle_discovery(event).await
            }
            k if event_kind::is_message(k) => self.handle_message(event, relay).await,
            _ => {
                debug!(kind, event_id = %event.id, "ignoring event kind");
                Ok(())
            }
        }
    }

    fn require_group_id(event: &Event) -> Result<String> {
        events::group_id_of(event)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound(format!("group tag on event {}", event.id)))
    }

    async fn handle_metadata(&self, event: &Event) -> Result<()> {
        let group = Group::from_metadata_event(event)
            .ok_or_else(|| Error::NotFound("d tag on group metadata".into()))?;
        let group_id = group.id.clone();

        let updated = self.state().await.groups.apply_metadata(group);
        if updated {
            debug!(group_id = %group_id, "group metadata updated");
            self.emit(Notification::GroupUpdated { group_id });
        }
        Ok(())
    }

    /// Relay-generated lists are snapshots: they only add. Recompute is
    /// debounced because relays re-send them in bursts.
    ///
    /// Member list entries usually carry no roles, so they leave roles from
    /// the admin list or a put-user in place.
    async fn handle_member_list(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let created_at = events::created_at_of(event);
        let listed = events::member_tags(event);
        let is_member_list = events::kind_of(event) == event_kind::GROUP_MEMBER_LIST;

        {
            let mut state = self.state().await;
            for (pubkey, roles) in listed {
                if is_member_list && roles.is_empty() {
                    state
                        .membership
                        .apply_listing(&group_id, &pubkey, created_at, roles_or_default(roles));
                } else {
                    state
                        .membership
                        .apply_add(&group_id, &pubkey, created_at, roles_or_default(roles));
                }
            }
        }
        self.debounced_recompute(&group_id);
        Ok(())
    }

    async fn handle_put_user(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let created_at = events::created_at_of(event);
        let me = self.my_pubkey_hex();
        let added = events::member_tags(event);

        {
            let mut state = self.state().await;
            for (pubkey, roles) in &added {
                state
                    .membership
                    .apply_add(&group_id, pubkey, created_at, roles_or_default(roles.clone()));
                state.groups.take_join_request(&group_id, pubkey);
                if *pubkey == me {
                    state.groups.drop_invites_for_group(&group_id);
                }
            }
        }
        self.recompute_membership(&group_id).await;
        Ok(())
    }

    async fn handle_remove_user(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let created_at = events::created_at_of(event);
        let removed = events::member_tags(event);

        {
            let mut state = self.state().await;
            for (pubkey, _) in &removed {
                state.membership.apply_remove(&group_id, pubkey, created_at);
                state.groups.take_join_request(&group_id, pubkey);
            }
        }
        self.recompute_membership(&group_id).await;
        Ok(())
    }

    async fn handle_leave_request(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let pubkey = event.pubkey.to_hex();
        self.state()
            .await
            .membership
            .apply_remove(&group_id, &pubkey, events::created_at_of(event));
        self.recompute_membership(&group_id).await;
        Ok(())
    }

    async fn handle_group_delete(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let author = event.pubkey.to_hex();
        {
            let mut state = self.state().await;
            // Only an admin may delete; unknown ledgers cannot be checked, so they are trusted to the relay
            if state.membership.ledger(&group_id).is_some()
                && !state.membership.has_role(&group_id, &author, ADMIN_ROLE)
            {
                return Err(Error::Precondition(format!(
                    "delete of {} by non-admin {}",
                    group_id, author
                )));
            }
            state.groups.remove_group(&group_id);
            state.membership.forget(&group_id);
        }
        self.inner.debounce_slots.cancel(&group_id);
        info!(group_id = %group_id, "group deleted");
        self.emit(Notification::GroupRemoved { group_id });
        Ok(())
    }

    async fn handle_join_request(&self, event: &Event) -> Result<()> {
        let group_id = Self::require_group_id(event)?;
        let pubkey = event.pubkey.to_hex();
        let request = JoinRequest {
            group_id: group_id.clone(),
            pubkey: pubkey.clone(),
            code: events::first_tag_value(event, "code").map(str::to_string),
            created_at: events::created_at_of(event),
        };

        let added = {
            let mut state = self.state().await;
            // Already a member: nothing to approve
            if state.membership.is_member(&group_id, &pubkey) {
                false
            } else {
                state.groups.add_join_request(request)
            }
        };
        if added {
            self.emit(Notification::JoinRequested { group_id, pubkey });
        }
        Ok(())
    }

    async fn handle_invite(&self, event: &Event) -> Result<()> {
        let me = self.my_pubkey_hex();
        let addressed_to_me = events::tags_named(event, "p")
            .filter_map(|values| values.get(1))
            .any(|pk| pk.eq_ignore_ascii_case(&me));
        if !addressed_to_me {
            return Ok(());
        }

        let group_id = Self::require_group_id(event)?;
        let plaintext = crypto::open_from(&self.inner.keys, &event.pubkey, &event.content)?;
        let payload: InvitePayload = serde_json::from_str(&plaintext)?;
        let invite = Invite {
            event_id: event.id.to_hex(),
            group_id: group_id.clone(),
            inviter: event.pubkey.to_hex(),
            payload,
            created_at: events::created_at_of(event),
        };
        let event_id = invite.event_id.clone();

        let added = {
            let mut state = self.state().await;
            if state.membership.is_member(&group_id, &me) {
                false
            } else {
                state.groups.add_invite(invite)
            }
        };
        if added {
            info!(group_id = %group_id, "invite received");
            self.emit(Notification::InviteReceived { event_id, group_id });
        }
        Ok(())
    }

    /// Register a secret sent to us. Returns `(group_id, created_at)` when the
    /// secret was new.
    pub(crate) async fn handle_secret(&self, event: &Event) -> Result<Option<(String, u64)>> {
        let me = self.my_pubkey_hex();
        let addressed_to_me = events::tags_named(event, "p")
            .filter_map(|values| values.get(1))
            .any(|pk| pk.eq_ignore_ascii_case(&me));
        if !addressed_to_me {
            return Ok(None);
        }

        let plaintext = crypto::open_from(&self.inner.keys, &event.pubkey, &event.content)?;
        let payload: SecretPayload = serde_json::from_str(&plaintext)?;
        if let Some(tagged) = events::group_id_of(event) {
            if tagged != payload.group_id {
                return Err(Error::Precondition(format!(
                    "secret for {} tagged with group {}",
                    payload.group_id, tagged
                )));
            }
        }
        let key = crypto::secret_from_hex(&payload.secret)?;
        // Timestamped by the inner event so rotation order follows the sender's clock
        let created_at = events::created_at_of(event);
        let latest_allowed = util::now_secs().saturating_add(MAX_SECRET_CLOCK_SKEW_SECS);
        if created_at > latest_allowed {
            return Err(Error::Precondition(format!(
                "secret for {} dated {} is in the future",
                payload.group_id, created_at
            )));
        }

        let sender = event.pubkey.to_hex();
        let registered = {
            let mut state = self.state().await;
            let trusted = sender == me || state.membership.has_role(&payload.group_id, &sender, ADMIN_ROLE);
            if !trusted {
                if state.replication.hold_secret(&payload.group_id, &sender, created_at, key) {
                    debug!(group_id = %payload.group_id, sender = %sender, "secret held until sender is an admin");
                }
                return Ok(None);
            }
            state.replication.register_secret(&payload.group_id, created_at, key)
        };
        if !registered {
            return Ok(None);
        }
        info!(group_id = %payload.group_id, created_at, "replication secret registered");
        self.emit(Notification::SecretRegistered {
            group_id: payload.group_id.clone(),
            created_at,
        });
        Ok(Some((payload.group_id, created_at)))
    }

    async fn handle_announcement(&self, event: &Event) -> Result<()> {
        let announcement =
            parse_announcement(event).ok_or_else(|| Error::NotFound("d or r tag on relay announcement".into()))?;
        let group_id = announcement.group_id.clone();
        let updated = self.state().await.groups.set_announcement(announcement);
        if updated {
            self.emit(Notification::GroupUpdated { group_id });
        }
        Ok(())
    }

    /// Replaceable events describing us
    async fn handle_discovery(&self, event: &Event) -> Result<()> {
        if event.pubkey != self.public_key() {
            return Ok(());
        }
        let mut state = self.state().await;
        let updated = match events::kind_of(event) {
            event_kind::PROFILE => state.discovery.set_profile(event),
            event_kind::FOLLOW_LIST => state.discovery.set_follows(event),
            _ => state.discovery.set_relay_list(event),
        };
        debug!(kind = events::kind_of(event), updated, "discovery data received");
        Ok(())
    }

    async fn handle_message(&self, event: &Event, relay: &str) -> Result<()> {
        let Some(group_id) = events::group_id_of(event).map(str::to_string) else {
            debug!(event_id = %event.id, "message without group tag");
            return Ok(());
        };

        let inserted = self.state().await.groups.push_message(&group_id, event.clone());
        if !inserted {
            return Ok(());
        }
        self.inner.store.put(&group_id, event).await?;
        debug!(group_id = %group_id, event_id = %event.id, relay, "message received");
        self.emit(Notification::MessageReceived {
            group_id,
            event: Box::new(event.clone()),
        });
        Ok(())
    }
}
