//! Logging setup for the agent binary.
//!
//! Events go to the console in compact form and to a daily rotated file
//! `agent.YYYY-MM-DD.log` in the configured directory. Thirty files are kept.

use std::path::Path;

use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter};

use crate::config::LoggingConfig;

/// Prefix of the rotated log files
pub const LOG_FILE_PREFIX: &str = "agent";

/// Number of daily log files retained
pub const MAX_LOG_FILES: usize = 30;

/// Error type for logging setup failures
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open log file: {0}")]
    Appender(#[from] InitError),

    #[error("a global subscriber is already installed: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Guard that keeps the file writer alive.
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Initialize console and file logging.
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    std::fs::create_dir_all(&config.directory)?;

    let file_appender = rolling_appender(&config.directory)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        log_dir = %config.directory.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rolling_appender(directory: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
}
