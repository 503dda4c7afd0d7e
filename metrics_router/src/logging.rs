//! Logging pipeline setup for the router binary.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Logging initialization failures; fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured level is not a valid filter directive.
    #[error("invalid log level {level:?}: {source}")]
    InvalidLevel {
        /// The configured value.
        level: String,
        /// Underlying parse error.
        source: tracing_subscriber::filter::ParseError,
    },
}

/// Installs the global subscriber.
///
/// With file logging enabled, output goes to daily-rolling files under the
/// configured directory and the returned guard must be held for the
/// process lifetime so buffered lines are flushed on shutdown. Otherwise
/// output goes to stderr.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, Error> {
    let level = if config.level.is_empty() {
        "info"
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_new(level).map_err(|source| Error::InvalidLevel {
        level: level.to_string(),
        source,
    })?;

    if config.enable && !config.path.is_empty() {
        let appender = tracing_appender::rolling::daily(&config.path, "router.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(None)
    }
}
