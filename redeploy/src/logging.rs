//! Operator-facing tracing output.
//!
//! Stage progress, retries and warnings go to stderr through `tracing`. The
//! run report is separate: it is printed to stdout (or written with
//! `--report`) and is unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=redeploy=debug redeploy run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
