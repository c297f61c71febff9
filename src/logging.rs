//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE: &str = "permit-cache.log";

/// Install the global subscriber: stderr always, plus a daily file when a
/// log directory is configured. `RUST_LOG` overrides the configured level.
///
/// Keep the returned guard alive for the life of the process, or buffered
/// file output is lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let level = parse_level(&config.level)?;
  let filter = || {
    EnvFilter::builder()
      .with_default_directive(level.into())
      .from_env_lossy()
  };

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(filter());

  let (file_layer, guard) = match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE));
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  tracing::debug!(level = %level, file = config.directory.is_some(), "logging initialized");
  Ok(guard)
}

fn parse_level(level: &str) -> Result<LevelFilter> {
  level
    .trim()
    .parse()
    .map_err(|_| eyre!("Invalid log level: {}", level))
}
