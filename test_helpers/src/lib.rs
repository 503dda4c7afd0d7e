//! Helpers shared by the test suites of the workspace crates.

use observability_deps::tracing::{self, info};
use parking_lot::Once;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is
/// set. Does nothing if RUST_LOG is not set.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging for tests, capturing output from dependencies that
/// still emit through the `log` facade as well.
pub fn start_logging() {
    // ensure the global has been initialized exactly once
    LOG_SETUP.call_once(|| {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
        let _ = tracing_log::LogTracer::init();

        info!("test logging initialized");
    })
}
