//! Diagnostic tracing for offload binaries.
//!
//! Output goes to stderr: a worker inherits the host's stdout, and anything
//! written there belongs to the user.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "OFFLOAD_LOG";

/// Install the global subscriber.
///
/// Reads [`LOG_ENV`]. Defaults to `warn` if unset or invalid.
///
/// # Example
/// ```bash
/// OFFLOAD_LOG=offload_core=debug offload-worker ./unit.so
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    // A host may already have installed its own subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
