//! Tracing setup for embedders and tests.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to the
//! host application. `init` is a convenience for hosts that just want formatted
//! output honouring `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive` (e.g. `"hypertuna_core=debug"`).
/// Returns false if a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("hypertuna_core=debug");
        assert!(!init("hypertuna_core=trace"));
    }
}
