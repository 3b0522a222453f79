//! Logging setup for the command line

/// Initialize the `tracing` subscriber
///
/// Honors `RUST_LOG`; if it is not set, logs at `info` (`debug` in debug builds).
pub fn setup_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let default_filter = if cfg!(debug_assertions) { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    // Already initialized when called more than once (tests)
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("Logging was already initialized");
    }
}
