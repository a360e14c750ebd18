//! Process-level tracing setup shared by binaries and integration tests.
//!
//! Example usage:
//!
//!   ops::tracing::init();
//!   tracing::info!(connection_id = %id, "opened connection");

use tracing_subscriber::prelude::*;

/// Install a JSON-lines subscriber writing to stderr, filtered by
/// `RUST_LOG` (default `info`). Safe to call once per process.
pub fn init() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
}

/// Like `init`, but human-readable output for tests and local runs.
/// Ignores errors from double-installation so each test may call it.
pub fn init_for_tests() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .try_init();
}
