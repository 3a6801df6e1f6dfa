//! Tracing setup for binaries and tests.
//!
//! The engine itself only emits `tracing` events; installing a subscriber
//! is left to the embedding application. This helper wires up the common
//! env-filtered stderr subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a global stderr subscriber honouring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
