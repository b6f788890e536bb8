//! Logging initialization.

use tracing_subscriber::EnvFilter;

use crate::LogLevel;

/// Initialize the global tracing subscriber once at startup. `RUST_LOG`
/// overrides the configured level when set.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
