//! Client engine for Hypertuna groups.
//!
//! Hypertuna groups are NIP-29 groups hosted on per-group relays, with an
//! encrypted mirror on a shared gateway relay. This crate is the engine behind
//! a group client:
//! - `relay`: per-group connection lifecycle gated on worker readiness
//! - `services`: subscription routing, event processing, replication, discovery
//! - `state`: groups, reconciled membership, replication secrets and cursors
//! - `commands`: outbound group actions
//! - `store`: local event cache (in-memory or SQLite)
//!
//! Networking, persistence and the shell/worker process are reached through
//! the traits in [`transport`], [`store`] and [`bridge`].

pub mod bridge;
pub mod client;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod logging;
pub mod relay;
pub mod services;
pub mod shared;
pub mod state;
pub mod store;
pub mod transport;
pub mod util;

#[cfg(test)]
mod testing;

pub use client::{Collaborators, GroupClient};
pub use commands::CreateGroupParams;
pub use config::ClientConfig;
pub use error::{Error, Result};
