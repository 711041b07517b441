//! Error types for the client engine.

use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum Error {
    /// Relay transport failure (connect, publish, subscribe)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay rejected our credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A bounded wait elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Symmetric or asymmetric encryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed JSON payload
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Local event store failure
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite failure inside the event store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Shell/worker bridge failure
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Operation not allowed in the current state (missing privilege, not a member, ...)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Relay or gateway URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Event building, signing or NIP-44 failure
    #[error("Nostr error: {0}")]
    Nostr(String),

    /// The client was shut down
    #[error("Client has been shut down")]
    Cancelled,
}

impl Error {
    /// Whether this failure should re-arm the connection with the auth delay
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;
