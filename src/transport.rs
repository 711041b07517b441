//! Network collaborators.
//!
//! The engine never speaks WebSocket itself. Relays are reached through a
//! [`RelayTransport`] and the encrypted replication channel through a
//! [`ReplicationGateway`]; embedders plug in whatever client they use.

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a connection. A relay that rejects our credentials must yield
    /// [`Error::Auth`](crate::error::Error::Auth) so the attempt is re-armed instead
    /// of backed off.
    async fn connect(&self, url: &str) -> Result<()>;

    async fn disconnect(&self, url: &str) -> Result<()>;

    /// Send a REQ under `wire_id`
    async fn subscribe(&self, url: &str, wire_id: &str, filters: &[Filter]) -> Result<()>;

    /// Send a CLOSE for `wire_id`
    async fn close_subscription(&self, url: &str, wire_id: &str) -> Result<()>;

    async fn publish(&self, url: &str, event: &Event) -> Result<()>;

    /// One-shot query that resolves on EOSE (or `timeout`) across `relays`
    async fn fetch_events(&self, relays: &[String], filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Event>>;
}

/// Envelope mirrored through the gateway.
///
/// `relayID` is the hash of the group identifier, never the identifier itself.
/// `eventData` is `base64(iv || ciphertext)` for content and `base64(event json)`
/// for secret distribution (whose content is already NIP-44 sealed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationWireEvent {
    pub id: String,
    #[serde(rename = "relayID")]
    pub relay_id: String,
    pub kind: u16,
    pub created_at: u64,
    #[serde(rename = "fileKey", default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(rename = "driveKey", default, skip_serializing_if = "Option::is_none")]
    pub drive_key: Option<String>,
    #[serde(rename = "eventData")]
    pub event_data: String,
}

#[async_trait]
pub trait ReplicationGateway: Send + Sync {
    async fn send(&self, gateway_url: &str, wire: &ReplicationWireEvent) -> Result<()>;

    /// Stream wire events for `relay_id` created after `since`. The stream ends
    /// when the gateway closes it; callers bound it with their own window.
    async fn subscribe(
        &self,
        gateway_url: &str,
        relay_id: &str,
        since: u64,
    ) -> Result<mpsc::Receiver<ReplicationWireEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let wire = ReplicationWireEvent {
            id: "abc".into(),
            relay_id: "hash".into(),
            kind: 9,
            created_at: 10,
            file_key: None,
            drive_key: Some("drive".into()),
            event_data: "AAAA".into(),
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["relayID"], "hash");
        assert_eq!(json["eventData"], "AAAA");
        assert_eq!(json["driveKey"], "drive");
        assert!(json.get("fileKey").is_none());

        let back: ReplicationWireEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, wire);
    }
}
