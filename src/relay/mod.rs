//! Relay connection lifecycle and URL handling.

pub mod connection;
pub mod url;

pub use connection::{
    AttemptDecision, ConnectionStatus, DeferReason, RegistrationDetails, RelayConnection,
    RelayConnectionManager, RelayMetadata,
};
