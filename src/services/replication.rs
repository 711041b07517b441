//! Encrypted replication through the gateway relay.
//!
//! Group events are mirrored to the gateway sealed under the group's newest
//! replication secret, so members can catch up while the group's own relay is
//! unreachable. Secrets rotate; old ones stay in the ring so history keeps
//! decrypting. A per-group cursor records the newest mirrored event already
//! ingested and bounds both cache replay and gateway fetches.

use nostr_sdk::prelude::*;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::client::GroupClient;
use crate::crypto::{self, relay_hash};
use crate::error::{Error, Result};
use crate::events::{self, event_kind};
use crate::relay::url::{gateway_relay_url, token_of};
use crate::services::event_handler::SecretPayload;
use crate::services::notifications::Notification;
use crate::shared::ResultExt;
use crate::store::EventQuery;
use crate::transport::ReplicationWireEvent;

/// Source label for events re-dispatched from the local cache
pub const CACHE_SOURCE: &str = "cache";
/// Source label for events recovered from the gateway
pub const GATEWAY_SOURCE: &str = "gateway";

/// Seal an event for the gateway under `key`
pub fn seal_wire(event: &Event, group_id: &str, key: &[u8; 32]) -> Result<ReplicationWireEvent> {
    Ok(ReplicationWireEvent {
        id: event.id.to_hex(),
        relay_id: relay_hash(group_id),
        kind: events::kind_of(event),
        created_at: events::created_at_of(event),
        file_key: events::first_tag_value(event, "fileKey").map(str::to_string),
        drive_key: events::first_tag_value(event, "driveKey").map(str::to_string),
        event_data: crypto::encrypt_payload(event.as_json().as_bytes(), key)?,
    })
}

/// Open a content wire. The inner event must verify and match the wire id.
pub fn open_wire(wire: &ReplicationWireEvent, key: &[u8; 32]) -> Result<Event> {
    let plaintext = crypto::decrypt_payload(&wire.event_data, key)?;
    let event = Event::from_json(&plaintext).context(Error::Nostr, "Mirrored event is not valid JSON")?;
    event.verify().context(Error::Nostr, "Mirrored event failed verification")?;
    if event.id.to_hex() != wire.id {
        return Err(Error::Crypto(format!("wire {} carried event {}", wire.id, event.id)));
    }
    Ok(event)
}

/// Wrap an already NIP-44 sealed secret-distribution event for the gateway
pub fn secret_wire(event: &Event, group_id: &str) -> ReplicationWireEvent {
    ReplicationWireEvent {
        id: event.id.to_hex(),
        relay_id: relay_hash(group_id),
        kind: event_kind::SECRET_DISTRIBUTION,
        created_at: events::created_at_of(event),
        file_key: None,
        drive_key: None,
        event_data: base64_simd::STANDARD.encode_to_string(event.as_json().as_bytes()),
    }
}

fn decode_secret_wire(wire: &ReplicationWireEvent) -> Result<Event> {
    let raw = base64_simd::STANDARD
        .decode_to_vec(wire.event_data.as_bytes())
        .context(Error::Crypto, "Secret wire is not valid base64")?;
    let event = Event::from_json(&raw).context(Error::Nostr, "Secret wire is not an event")?;
    event.verify().context(Error::Nostr, "Secret event failed verification")?;
    if events::kind_of(&event) != event_kind::SECRET_DISTRIBUTION {
        return Err(Error::Precondition(format!("secret wire wraps kind {}", event.kind.as_u16())));
    }
    Ok(event)
}

/// Outcome of one ingest batch
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Decrypted content events, in batch order
    pub events: Vec<Event>,
    pub secrets_registered: usize,
    /// Wires that failed to decrypt or decode
    pub skipped: usize,
    /// Wires addressed to another relay hash
    pub dropped: usize,
    pub cursor: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecretDistribution {
    pub created_at: u64,
    pub sent: usize,
    pub mirrored: usize,
}

impl GroupClient {
    /// Gateway URL for a group: the configured base, authenticated with the
    /// group's relay token when we hold one.
    pub async fn gateway_url(&self, group_id: &str) -> Option<String> {
        let base = self.inner.config.gateway.base_url.as_deref()?;
        let token = self
            .state()
            .await
            .connections
            .url_for(group_id)
            .and_then(|url| token_of(&url))
            .or_else(|| self.inner.config.gateway.auth_token.clone());

        match gateway_relay_url(base, token.as_deref()) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "invalid gateway base url");
                None
            }
        }
    }

    /// Mirror an event to the gateway. Returns false (no-op) when the group has
    /// replication off, no secret is known, or no gateway is configured.
    pub async fn publish_replica(&self, event: &Event, group_id: &str) -> Result<bool> {
        self.ensure_active()?;
        let key = {
            let state = self.state().await;
            let enabled = state
                .groups
                .group(group_id)
                .map(|g| g.encrypted_replication)
                .unwrap_or(false);
            if !enabled {
                return Ok(false);
            }
            match state.replication.newest_secret(group_id) {
                Some(secret) => secret.key.clone(),
                None => {
                    debug!(group_id, "no replication secret yet, skipping mirror");
                    return Ok(false);
                }
            }
        };
        let Some(url) = self.gateway_url(group_id).await else {
            return Ok(false);
        };

        let wire = seal_wire(event, group_id, &key)?;
        self.inner.gateway.send(&url, &wire).await?;
        debug!(group_id, event_id = %wire.id, "event mirrored");
        Ok(true)
    }

    /// Ingest a batch of wire events for `group_id`.
    ///
    /// Secret-distribution wires are processed first so content in the same
    /// batch can use them. A wire that fails only skips itself.
    pub async fn ingest(&self, group_id: &str, wires: Vec<ReplicationWireEvent>) -> Result<IngestReport> {
        self.ensure_active()?;
        let expected = relay_hash(group_id);
        let mut report = IngestReport::default();

        let mut secrets = Vec::new();
        let mut content = Vec::new();
        for wire in wires {
            if wire.relay_id != expected {
                report.dropped += 1;
                continue;
            }
            if wire.kind == event_kind::SECRET_DISTRIBUTION {
                secrets.push(wire);
            } else {
                content.push(wire);
            }
        }

        for wire in &secrets {
            let outcome = match decode_secret_wire(wire) {
                Ok(inner) => self.handle_secret(&inner).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Some(_)) => report.secrets_registered += 1,
                Ok(None) => {}
                Err(e) => {
                    report.skipped += 1;
                    debug!(group_id, wire_id = %wire.id, error = %e, "skipping secret wire");
                }
            }
        }

        let mut newest: Option<u64> = None;
        for wire in &content {
            let key = self
                .state()
                .await
                .replication
                .secret_for(group_id, wire.created_at)
                .map(|s| s.key.clone());
            let Some(key) = key else {
                report.skipped += 1;
                debug!(group_id, wire_id = %wire.id, "no secret for wire");
                continue;
            };

            let event = match open_wire(wire, &key) {
                Ok(event) => event,
                Err(e) => {
                    report.skipped += 1;
                    debug!(group_id, wire_id = %wire.id, error = %e, "skipping undecryptable wire");
                    continue;
                }
            };
            if let Err(e) = self.inner.store.put(group_id, &event).await {
                report.skipped += 1;
                warn!(group_id, wire_id = %wire.id, error = %e, "failed to cache mirrored event");
                continue;
            }
            newest = Some(newest.unwrap_or(0).max(wire.created_at));
            report.events.push(event);
        }

        let mut state = self.state().await;
        report.cursor = match newest {
            Some(ts) => state.replication.group_mut(group_id).advance_cursor(ts),
            None => state.replication.cursor(group_id),
        };
        Ok(report)
    }

    /// Re-dispatch cached events newer than the cursor, oldest first, then
    /// advance the cursor past them. Returns how many were replayed.
    pub async fn replay_from_cache(&self, group_id: &str) -> Result<usize> {
        self.ensure_active()?;
        let cursor = self.state().await.replication.cursor(group_id);
        let mut cached = self
            .inner
            .store
            .query(group_id, &EventQuery::default().since(cursor.saturating_add(1)))
            .await?;
        cached.reverse();
        cached.truncate(self.inner.config.replay_limit);

        let mut newest = None;
        for event in &cached {
            if let Err(e) = self.process_event(event, CACHE_SOURCE).await {
                debug!(group_id, event_id = %event.id, error = %e, "cached event skipped");
            }
            newest = Some(newest.unwrap_or(0).max(events::created_at_of(event)));
        }
        if let Some(ts) = newest {
            self.state().await.replication.group_mut(group_id).advance_cursor(ts);
        }
        if !cached.is_empty() {
            debug!(group_id, replayed = cached.len(), "replayed cached events");
        }
        Ok(cached.len())
    }

    /// Best-effort catch-up: collect gateway wires since the cursor for at
    /// most the snapshot window, ingest them and dispatch what decrypted.
    pub async fn fetch_snapshot(&self, group_id: &str) -> Result<IngestReport> {
        self.ensure_active()?;
        let Some(url) = self.gateway_url(group_id).await else {
            return Ok(IngestReport::default());
        };
        let since = self.state().await.replication.cursor(group_id);
        let mut rx = self.inner.gateway.subscribe(&url, &relay_hash(group_id), since).await?;

        let mut wires = Vec::new();
        let window = self.inner.config.snapshot_window();
        let collect = async {
            while let Some(wire) = rx.recv().await {
                wires.push(wire);
            }
        };
        if tokio::time::timeout(window, collect).await.is_err() {
            debug!(group_id, collected = wires.len(), "snapshot window elapsed");
        }

        let report = self.ingest(group_id, wires).await?;
        for event in &report.events {
            if let Err(e) = self.process_event(event, GATEWAY_SOURCE).await {
                debug!(group_id, event_id = %event.id, error = %e, "mirrored event skipped");
            }
        }
        info!(group_id, ingested = report.events.len(), cursor = report.cursor, "replication caught up");
        self.emit(Notification::ReplicationCaughtUp {
            group_id: group_id.to_string(),
            cursor: report.cursor,
            ingested: report.events.len(),
        });
        Ok(report)
    }

    /// Rotate in a fresh secret and hand it to each recipient (current members
    /// other than us when `recipients` is empty). Each copy is also mirrored to
    /// the gateway so offline members can recover it.
    pub async fn distribute_secret(&self, group_id: &str, recipients: &[PublicKey]) -> Result<SecretDistribution> {
        self.ensure_active()?;
        self.require_admin(group_id).await?;

        let me = self.my_pubkey_hex();
        let recipients: Vec<PublicKey> = if recipients.is_empty() {
            self.members(group_id)
                .await
                .into_iter()
                .filter(|m| m.pubkey != me)
                .filter_map(|m| PublicKey::from_hex(&m.pubkey).ok())
                .collect()
        } else {
            recipients.to_vec()
        };

        let secret = crypto::generate_secret();
        let created_at = crate::util::now_secs();
        self.state()
            .await
            .replication
            .register_secret(group_id, created_at, secret.clone());
        self.emit(Notification::SecretRegistered {
            group_id: group_id.to_string(),
            created_at,
        });

        let payload = Zeroizing::new(serde_json::to_string(&SecretPayload {
            group_id: group_id.to_string(),
            secret: crypto::secret_to_hex(&secret),
        })?);
        let gateway_url = self.gateway_url(group_id).await;

        let mut outcome = SecretDistribution { created_at, ..Default::default() };
        for recipient in &recipients {
            let sealed = crypto::seal_for(&self.inner.keys, recipient, &payload)?;
            let recipient_hex = recipient.to_hex();
            let event = EventBuilder::new(Kind::from(event_kind::SECRET_DISTRIBUTION), sealed)
                .tags([
                    events::tag("d", [format!("{}:{}:{}", group_id, recipient_hex, created_at)]),
                    events::tag("h", [group_id]),
                    events::tag("p", [recipient_hex.as_str()]),
                ])
                .custom_created_at(Timestamp::from_secs(created_at))
                .sign_with_keys(&self.inner.keys)
                .context(Error::Nostr, "Failed to sign secret distribution")?;

            match self.publish_to_group(group_id, &event).await {
                Ok(_) => outcome.sent += 1,
                Err(e) => warn!(group_id, error = %e, "secret distribution publish failed"),
            }
            if let Some(url) = &gateway_url {
                match self.inner.gateway.send(url, &secret_wire(&event, group_id)).await {
                    Ok(()) => outcome.mirrored += 1,
                    Err(e) => warn!(group_id, error = %e, "secret mirror failed"),
                }
            }
        }
        info!(group_id, recipients = recipients.len(), sent = outcome.sent, "replication secret distributed");
        Ok(outcome)
    }
}
