//! Invites and join requests.
//!
//! This module handles:
//! - Sealed invites (kind 9009) carrying the relay URL and access token
//! - Accepting an invite by queueing its relay
//! - Join requests (kind 9021) and their approval or rejection

use nostr_sdk::prelude::*;
use tracing::info;

use crate::client::GroupClient;
use crate::crypto;
use crate::error::{Error, Result};
use crate::events::{event_kind, tag};
use crate::relay::url::with_token;
use crate::shared::{OptionExt, ResultExt};
use crate::state::InvitePayload;

impl GroupClient {
    /// Send an invite to `invitee`. The payload is NIP-44 sealed for them.
    pub async fn create_invite(&self, group_id: &str, invitee: &PublicKey, payload: InvitePayload) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let sealed = crypto::seal_for(&self.inner.keys, invitee, &serde_json::to_string(&payload)?)?;
        let invitee_hex = invitee.to_hex();
        let event = self.sign(
            event_kind::GROUP_INVITE_CREATE,
            &sealed,
            vec![tag("h", [group_id]), tag("p", [invitee_hex.as_str()])],
        )?;
        self.publish_to_group(group_id, &event).await?;
        info!(group_id, "invite sent");
        Ok(event)
    }

    /// Accept a received invite: its relay is queued (with the token, when
    /// the invite carries one) and connects once ready.
    pub async fn accept_invite(&self, event_id: &str) -> Result<String> {
        self.ensure_active()?;
        let invite = self
            .state()
            .await
            .groups
            .invite(event_id)
            .cloned()
            .ok_or_context("Invite")?;

        let token = invite.payload.token.as_deref().filter(|t| !t.is_empty());
        let url = match token {
            Some(token) => with_token(&invite.payload.relay_url, token)?,
            None => invite.payload.relay_url.clone(),
        };
        let requires_auth = token.is_some();
        // A rejected URL leaves the invite in place
        self.queue_relay(&invite.group_id, &url, Some(requires_auth)).await?;
        self.state().await.groups.take_invite(event_id);
        info!(group_id = %invite.group_id, requires_auth, "invite accepted");
        Ok(invite.group_id)
    }

    /// Ask to join a group, optionally presenting an invite code.
    pub async fn request_join(&self, group_id: &str, code: Option<&str>) -> Result<Event> {
        self.ensure_active()?;
        let mut tags = vec![tag("h", [group_id])];
        if let Some(code) = code {
            tags.push(tag("code", [code]));
        }
        let event = self.sign(event_kind::GROUP_JOIN_REQUEST, "", tags)?;
        self.publish_to_group(group_id, &event).await?;
        Ok(event)
    }

    /// Approve a pending join request by adding the requester as a member.
    pub async fn approve_join_request(&self, group_id: &str, pubkey: &str) -> Result<Event> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let pending = self
            .state()
            .await
            .groups
            .join_requests(group_id)
            .iter()
            .any(|r| r.pubkey.eq_ignore_ascii_case(pubkey));
        if !pending {
            return Err(Error::NotFound(format!("Join request from {} for {}", pubkey, group_id)));
        }

        let requester = PublicKey::from_hex(pubkey).context(Error::Nostr, "Invalid requester pubkey")?;
        // The put-user clears the request once applied
        self.add_member(group_id, &requester, Vec::new()).await
    }

    pub async fn reject_join_request(&self, group_id: &str, pubkey: &str) -> Result<()> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        self.state()
            .await
            .groups
            .take_join_request(group_id, &pubkey.to_lowercase())
            .ok_or_context("Join request")?;
        info!(group_id, "join request rejected");
        Ok(())
    }
}
