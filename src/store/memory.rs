use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use nostr_sdk::prelude::*;

use super::{EventQuery, EventStore};
use crate::error::Result;

/// In-process cache keyed by group, ordered by (created_at, id)
#[derive(Default)]
pub struct MemoryEventStore {
    groups: Mutex<HashMap<String, BTreeMap<(u64, String), Event>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, group_id: &str) -> usize {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.get(group_id).map(|g| g.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn put(&self, group_id: &str, event: &Event) -> Result<bool> {
        let key = (event.created_at.as_u64(), event.id.to_hex());
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups.entry(group_id.to_string()).or_default();
        if group.contains_key(&key) {
            return Ok(false);
        }
        group.insert(key, event.clone());
        Ok(true)
    }

    async fn query(&self, group_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = groups.get(group_id) else {
            return Ok(Vec::new());
        };

        let matching = group
            .values()
            .rev()
            .filter(|e| query.matches(e.kind.as_u16(), e.created_at.as_u64()))
            .cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn clear(&self, group_id: &str) -> Result<()> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).remove(group_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(created_at: u64) -> Event {
        EventBuilder::new(Kind::from(9), format!("m{}", created_at))
            .custom_created_at(Timestamp::from_secs(created_at))
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryEventStore::new();
        let event = message(10);
        assert!(store.put("g1", &event).await.unwrap());
        assert!(!store.put("g1", &event).await.unwrap());
        assert_eq!(store.len("g1"), 1);
    }

    #[tokio::test]
    async fn test_query_newest_first_with_limit() {
        let store = MemoryEventStore::new();
        for t in [30, 10, 20] {
            store.put("g1", &message(t)).await.unwrap();
        }

        let all = store.query("g1", &EventQuery::default()).await.unwrap();
        let times: Vec<u64> = all.iter().map(|e| e.created_at.as_u64()).collect();
        assert_eq!(times, vec![30, 20, 10]);

        let recent = store.query("g1", &EventQuery::default().since(15).limit(1)).await.unwrap();
        assert_eq!(recent[0].created_at.as_u64(), 30);
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_scoped_and_global() {
        let store = MemoryEventStore::new();
        store.put("g1", &message(1)).await.unwrap();
        store.put("g2", &message(2)).await.unwrap();

        store.clear("g1").await.unwrap();
        assert_eq!(store.len("g1"), 0);
        assert_eq!(store.len("g2"), 1);

        store.clear_all().await.unwrap();
        assert_eq!(store.len("g2"), 0);
    }
}
