//! Telemetry initialisation for the connector.
//!
//! The connector uses a lightweight setup: structured JSON logs only. The
//! hosting process is expected to call [`init`] once before spawning the
//! connector loop.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber for the connector.
///
/// Outputs structured JSON logs to stdout at the configured log level;
/// `RUST_LOG` takes precedence when set.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise connector tracing subscriber: {e}"))
}
