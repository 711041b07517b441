//! Per-group replication secrets and replay cursors.

use std::collections::HashMap;

use crate::crypto::SecretKeyBytes;

#[derive(Clone)]
pub struct ReplicationSecret {
    pub created_at: u64,
    pub key: SecretKeyBytes,
}

impl std::fmt::Debug for ReplicationSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSecret")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Secrets for one group, newest first. Entries are never removed in a session,
/// which is what lets rotated-out secrets keep decrypting history.
#[derive(Debug, Clone, Default)]
pub struct SecretRing {
    secrets: Vec<ReplicationSecret>,
}

impl SecretRing {
    /// Insert keeping newest-first order. Returns false if this exact secret is
    /// already known at the same timestamp.
    pub fn insert(&mut self, created_at: u64, key: SecretKeyBytes) -> bool {
        if self
            .secrets
            .iter()
            .any(|s| s.created_at == created_at && *s.key == *key)
        {
            return false;
        }
        // First index whose secret is older than the new one
        let pos = self.secrets.partition_point(|s| s.created_at >= created_at);
        self.secrets.insert(pos, ReplicationSecret { created_at, key });
        true
    }

    pub fn newest(&self) -> Option<&ReplicationSecret> {
        self.secrets.first()
    }

    pub fn oldest(&self) -> Option<&ReplicationSecret> {
        self.secrets.last()
    }

    /// Newest secret created at or before `timestamp`, falling back to the oldest
    /// known secret when every secret postdates it.
    pub fn for_timestamp(&self, timestamp: u64) -> Option<&ReplicationSecret> {
        self.secrets
            .iter()
            .find(|s| s.created_at <= timestamp)
            .or_else(|| self.oldest())
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupReplication {
    pub secrets: SecretRing,
    /// Highest `created_at` already ingested from the replication channel
    cursor: u64,
}

impl GroupReplication {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Move the cursor forward; never moves it back.
    pub fn advance_cursor(&mut self, to: u64) -> u64 {
        self.cursor = self.cursor.max(to);
        self.cursor
    }
}

/// A secret whose sender is not (yet) known to be a group admin
#[derive(Debug, Clone)]
pub struct PendingSecret {
    pub sender: String,
    pub secret: ReplicationSecret,
}

#[derive(Debug, Default)]
pub struct ReplicationState {
    groups: HashMap<String, GroupReplication>,
    pending: HashMap<String, Vec<PendingSecret>>,
}

impl ReplicationState {
    pub fn group(&self, group_id: &str) -> Option<&GroupReplication> {
        self.groups.get(group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> &mut GroupReplication {
        self.groups.entry(group_id.to_string()).or_default()
    }

    pub fn cursor(&self, group_id: &str) -> u64 {
        self.groups.get(group_id).map(|g| g.cursor()).unwrap_or(0)
    }

    pub fn register_secret(&mut self, group_id: &str, created_at: u64, key: SecretKeyBytes) -> bool {
        self.group_mut(group_id).secrets.insert(created_at, key)
    }

    /// Hold a secret until its sender shows up as an admin. Returns false if
    /// the same secret is already held.
    pub fn hold_secret(&mut self, group_id: &str, sender: &str, created_at: u64, key: SecretKeyBytes) -> bool {
        let held = self.pending.entry(group_id.to_string()).or_default();
        if held
            .iter()
            .any(|p| p.sender == sender && p.secret.created_at == created_at && *p.secret.key == *key)
        {
            return false;
        }
        held.push(PendingSecret {
            sender: sender.to_string(),
            secret: ReplicationSecret { created_at, key },
        });
        true
    }

    /// Move held secrets whose sender passes `trusted` into the ring. Returns
    /// the timestamps of the secrets that were newly registered.
    pub fn promote_pending(&mut self, group_id: &str, trusted: impl Fn(&str) -> bool) -> Vec<u64> {
        let Some(held) = self.pending.remove(group_id) else {
            return Vec::new();
        };
        let (accepted, waiting): (Vec<_>, Vec<_>) = held.into_iter().partition(|p| trusted(&p.sender));
        if !waiting.is_empty() {
            self.pending.insert(group_id.to_string(), waiting);
        }

        accepted
            .into_iter()
            .filter(|p| self.register_secret(group_id, p.secret.created_at, p.secret.key.clone()))
            .map(|p| p.secret.created_at)
            .collect()
    }

    pub fn pending_count(&self, group_id: &str) -> usize {
        self.pending.get(group_id).map(Vec::len).unwrap_or(0)
    }

    pub fn newest_secret(&self, group_id: &str) -> Option<&ReplicationSecret> {
        self.groups.get(group_id)?.secrets.newest()
    }

    pub fn secret_for(&self, group_id: &str, timestamp: u64) -> Option<&ReplicationSecret> {
        self.groups.get(group_id)?.secrets.for_timestamp(timestamp)
    }

    pub fn forget(&mut self, group_id: &str) {
        self.groups.remove(group_id);
        self.pending.remove(group_id);
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.pending.clear();
    }
}
