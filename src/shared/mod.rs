//! Shared utilities used across the engine.
//!
//! - `error`: Result extension traits for attaching context to foreign errors
//! - `tasks`: Keyed cancellable timers (one live task per key)

pub mod error;
pub mod tasks;

pub use error::{OptionExt, ResultExt};
pub use tasks::TaskSlots;
