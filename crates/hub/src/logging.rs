//! Tracing subscriber setup.
//!
//! Embedding applications call [`init_logging`] once at startup. When a log
//! directory is configured, a daily-rolling file is written through a
//! non-blocking writer whose guard must be kept alive for the process
//! lifetime.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Log file prefix inside the configured directory.
const LOG_FILE_PREFIX: &str = "forgehub.log";

/// Builds the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Installs the global tracing subscriber.
///
/// Returns the file writer guard when file logging is enabled. Fails if a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("Failed to install tracing subscriber")?;

            tracing::info!("Logging to {}", dir.display());
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}
