//! Engine services.
//!
//! This module contains the logic that runs between the transport and state:
//! - `subscriptions`: Hash-deduplicated subscriptions and handler dispatch
//! - `event_handler`: Kind dispatcher for incoming group events
//! - `replication`: Encrypted mirroring through the gateway relay
//! - `bootstrap`: Discovery fetches and long-lived discovery subscriptions
//! - `notifications`: Typed notification bus
//!
//! Most services are further `impl GroupClient` blocks; the router and the bus
//! are plain types owned by the client.

pub mod bootstrap;
pub mod event_handler;
pub mod notifications;
pub mod replication;
pub mod subscriptions;

pub use bootstrap::BootstrapReport;
pub use notifications::{EventBus, ListenerToken, Notification, Topic};
pub use replication::{IngestReport, SecretDistribution};
pub use subscriptions::{DispatchReport, EventHandler, SubscribeOptions, SubscribeOutcome};
