//! Local event cache.
//!
//! Events are cached per group so a client can replay history after a restart
//! without going back to the network. The engine only needs four operations;
//! the persistence engine behind them is up to the embedder.

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

/// Range query over one group's cached events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Inclusive lower bound on `created_at`
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`
    pub until: Option<u64>,
    /// Restrict to these kinds; empty means any kind
    pub kinds: Vec<u16>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event with this kind and timestamp falls inside the query bounds
    pub fn matches(&self, kind: u16, created_at: u64) -> bool {
        self.since.map(|s| created_at >= s).unwrap_or(true)
            && self.until.map(|u| created_at <= u).unwrap_or(true)
            && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Cache an event under a group. Returns false if it was already cached.
    async fn put(&self, group_id: &str, event: &Event) -> Result<bool>;

    /// Matching events, newest first
    async fn query(&self, group_id: &str, query: &EventQuery) -> Result<Vec<Event>>;

    /// Drop one group's cached events
    async fn clear(&self, group_id: &str) -> Result<()>;

    /// Drop everything
    async fn clear_all(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_bounds() {
        let q = EventQuery::default().since(10).until(20).kinds([9]);
        assert!(q.matches(9, 10));
        assert!(q.matches(9, 20));
        assert!(!q.matches(9, 21));
        assert!(!q.matches(1, 15));
        assert!(EventQuery::default().matches(1, 0));
    }
}
