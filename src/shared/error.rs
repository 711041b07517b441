//! Error handling utilities to reduce duplicate `.map_err()` patterns.

use crate::error::{Error, Result};

/// Extension trait for adding context to Result types.
///
/// The first argument picks the [`Error`] variant the failure lands in; tuple
/// variants are plain `fn(String) -> Error` so they can be passed directly.
///
/// # Example
/// ```rust,ignore
/// use crate::shared::ResultExt;
///
/// let event = builder.sign_with_keys(&keys).context(Error::Nostr, "Failed to sign event")?;
/// ```
pub trait ResultExt<T, E> {
    /// Add context to an error, wrapping it in the given variant.
    fn context(self, variant: fn(String) -> Error, msg: &str) -> Result<T>;

    /// Add context with a closure for lazy evaluation.
    fn with_context<F: FnOnce() -> String>(self, variant: fn(String) -> Error, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, variant: fn(String) -> Error, msg: &str) -> Result<T> {
        self.map_err(|e| variant(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, variant: fn(String) -> Error, f: F) -> Result<T> {
        self.map_err(|e| variant(format!("{}: {}", f(), e)))
    }
}

/// Extension trait for Option types to convert to Result with context.
pub trait OptionExt<T> {
    /// Convert Option to a `NotFound` error with a message.
    fn ok_or_context(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| Error::NotFound(msg.to_string()))
    }
}
