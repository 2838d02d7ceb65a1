//! Logging initialization for the client.

use tracing_subscriber::EnvFilter;

/// Initialize tracing output for the client.
///
/// The level comes from the RUST_LOG env var when set, otherwise from
/// the provided default. Safe to call more than once; only the first
/// call installs the subscriber.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
