//! Logging setup for tests and tools.

/// Installs a `tracing` subscriber for the process.
///
/// The filter is taken from the `RUST_LOG` environment variable, e.g.
/// `RUST_LOG=trace`. Calling this more than once is harmless.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
