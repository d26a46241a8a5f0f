//! Process-wide tracing setup.

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `level`. Records emitted through the `log` facade
/// (the database layer) are forwarded into tracing.
pub fn init_logging(level: &str, json: bool) -> Result<(), LoggingError> {
    let default_level = parse_level(level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    LogTracer::init().map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    let result = if json {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_names(true),
        );
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true),
        );
        tracing::subscriber::set_global_default(subscriber)
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
