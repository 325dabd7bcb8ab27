//! Structured logging setup.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer alive; dropping it flushes pending lines.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
    log_path: Option<PathBuf>,
}

impl LoggingGuard {
    /// Path of the per-run log file, when file logging is enabled.
    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }
}

/// Installs the global subscriber.
///
/// # Errors
/// Returns [`LoggingError`] when the filter does not parse, the log
/// directory cannot be created, or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let filter = EnvFilter::try_new(&config.filter)?;

    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(config.format)];
    let mut worker = None;
    let mut log_path = None;

    if let Some(directory) = &config.directory {
        fs::create_dir_all(directory)?;
        let file_name = format!("{}_capwatch.log", timestamp_compact_utc());
        let appender = tracing_appender::rolling::never(directory, &file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        worker = Some(guard);
        log_path = Some(directory.join(file_name));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    if let Some(path) = &log_path {
        info!(stage = "logging", action = "file_enabled", path = %path.display());
    }

    Ok(LoggingGuard {
        _worker: worker,
        log_path,
    })
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Human => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .boxed(),
    }
}

/// UTC timestamp used in log file names, e.g. `20240131_235959`.
pub fn timestamp_compact_utc() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Logging setup error type.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Log directory could not be created.
    #[error("failed to prepare log directory: {0}")]
    Io(#[from] io::Error),
    /// `CAPWATCH_LOG` did not parse.
    #[error("invalid logging filter: {0}")]
    Filter(#[from] ParseError),
    /// A global subscriber was already installed.
    #[error("failed to install logging subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}
