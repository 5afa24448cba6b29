//! Logging initialisation
//!
//! Console output is always on. When a log directory is configured, all
//! events are also written to a daily-rolling `tandem.log` in it.
//!
//! The level comes from the `TANDEM_LOG` environment variable (any
//! `EnvFilter` directive), falling back to the configured level.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_ENV: &str = "TANDEM_LOG";
pub const LOG_FILE_NAME: &str = "tandem.log";

/// Logging configuration for the node
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for `tandem.log`; no file output when unset
    pub log_dir: Option<PathBuf>,
    pub level: Level,
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            level: Level::INFO,
            console_output: true,
        }
    }
}

impl LoggingConfig {
    pub fn from_config(log_dir: Option<PathBuf>, level: &str) -> Self {
        Self {
            log_dir,
            level: level.parse().unwrap_or(Level::INFO),
            console_output: true,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keeps the file writer alive; buffered output is flushed on drop
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(config.filter());
        layers.push(Box::new(console_layer));
    }

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Some(log_dir) = &config.log_dir {
        tracing::info!(log_dir = %log_dir.display(), "File logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
