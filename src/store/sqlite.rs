//! SQLite-backed event cache.
//!
//! One row per (group, event). The raw event JSON is kept verbatim so cached
//! events can be re-verified and re-dispatched exactly as received.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use rusqlite::{params, Connection};
use tracing::warn;

use super::{EventQuery, EventStore};
use crate::error::{Error, Result};
use crate::shared::ResultExt;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS group_events (
    group_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    kind INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (group_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_group_events_time ON group_events(group_id, created_at DESC);
"#;

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn put(&self, group_id: &str, event: &Event) -> Result<bool> {
        let conn = self.conn();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO group_events (group_id, event_id, kind, created_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                group_id,
                event.id.to_hex(),
                event.kind.as_u16() as i64,
                event.created_at.as_u64() as i64,
                event.as_json(),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn query(&self, group_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        let mut sql = String::from(
            "SELECT payload FROM group_events WHERE group_id = ?1 \
             AND (?2 IS NULL OR created_at >= ?2) \
             AND (?3 IS NULL OR created_at <= ?3)",
        );
        if !query.kinds.is_empty() {
            // Kinds are integers, safe to inline
            let kinds: Vec<String> = query.kinds.iter().map(|k| k.to_string()).collect();
            sql.push_str(&format!(" AND kind IN ({})", kinds.join(",")));
        }
        sql.push_str(" ORDER BY created_at DESC, event_id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let payloads = stmt
            .query_map(
                params![
                    group_id,
                    query.since.map(|s| s as i64),
                    query.until.map(|u| u as i64),
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        let mut events = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match Event::from_json(&payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(group_id, error = %e, "skipping unreadable cached event"),
            }
        }
        Ok(events)
    }

    async fn clear(&self, group_id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM group_events WHERE group_id = ?1", params![group_id])
            .context(Error::Store, "Failed to clear group cache")?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM group_events", [])
            .context(Error::Store, "Failed to clear cache")?;
        Ok(())
    }
}
