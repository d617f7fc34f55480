//! Structured logging
//!
//! This module provides functionality for:
//! 1. Filtering by the configured level, with `RUST_LOG` taking precedence
//! 2. Writing to a daily rolling file in JSON or line format
//! 3. Optionally mirroring events to the terminal

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Log file prefix inside the log directory
pub const LOG_FILE_PREFIX: &str = "dataset_wrangler.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the background file writer alive. Drop it last.
pub struct LoggerGuard {
    _file: Option<WorkerGuard>,
}

/// Build the level filter for `level`
pub fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| LoggerError::Filter {
        filter: level.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber described by `config`, logging files under `log_dir`
pub fn init_logger(config: &LoggingConfig, log_dir: &Path) -> LoggerResult<LoggerGuard> {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.log_level)?,
    };

    let (file_layer, file_guard) = if config.log_to_file {
        std::fs::create_dir_all(log_dir)?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match config.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let terminal_layer = config
        .log_to_terminal
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(terminal_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %config.log_format,
        log_level = %config.log_level,
        "Logger initialized"
    );

    Ok(LoggerGuard { _file: file_guard })
}
