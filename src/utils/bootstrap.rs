//! Bootstrap utilities for pghistorian binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the PGHISTORIAN_LOG environment variable.
///
/// Defaults to "info" level if PGHISTORIAN_LOG is not set. The library never
/// calls this; embedding applications install their own subscriber.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(crate::config::LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
