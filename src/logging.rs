//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable holding a filter directive, e.g. `ledger_cache=debug`.
pub const LOG_ENV: &str = "LEDGER_CACHE_LOG";

/// Filter from `LEDGER_CACHE_LOG`, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(&directive)
      .map_err(|e| eyre!("Failed to parse {}={}: {}", LOG_ENV, directive, e)),
    _ => EnvFilter::try_new(default_level)
      .map_err(|e| eyre!("Failed to parse log level {}: {}", default_level, e)),
  }
}

/// Install the global subscriber.
///
/// Logs go to stderr unless `logging.file` is set, in which case they are
/// appended to that file through a background writer. Keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = env_filter(&config.level)?;
  let registry = tracing_subscriber::registry().with(filter);

  match &config.file {
    Some(path) => {
      let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
      registry
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      registry
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}

fn open_log_file(path: &Path) -> Result<fs::File> {
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", parent.display(), e))?;
  }
  fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))
}
