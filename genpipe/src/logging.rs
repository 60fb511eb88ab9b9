//! Tracing setup for the `genpipe` binary.
//!
//! Logs go to stderr so the run summary on stdout stays machine-readable.
//! Per-job tool output is not logged here; it lands in `<output_root>/logs/`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "genpipe=info,warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `genpipe=info,warn` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=genpipe=debug genpipe run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
