//! Tracing subscriber setup.
//!
//! Console output always goes to stdout. When `Logger.logsDir` is set a second
//! layer writes the same events to a daily rolling `devsim.log` through a
//! non-blocking writer. `RUST_LOG` overrides the configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggerConfig;

const LOG_FILE_PREFIX: &str = "devsim.log";

/// Build the level filter: `RUST_LOG` when present and valid, else the config level.
#[must_use]
pub fn build_filter(config: &LoggerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level_directive()))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed on exit.
pub fn init(config: &LoggerConfig) -> Option<WorkerGuard> {
    let console = fmt::layer().with_target(false);

    let (file_layer, guard) = match file_writer(config) {
        Some((writer, guard)) => (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(console)
        .with(file_layer)
        .init();

    if guard.is_none() && !config.logs_dir.trim().is_empty() {
        tracing::warn!(logs_dir = %config.logs_dir, "log directory unavailable; file logging disabled");
    }
    guard
}

fn file_writer(config: &LoggerConfig) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = config.logs_dir.trim();
    if dir.is_empty() || std::fs::create_dir_all(dir).is_err() {
        return None;
    }
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Some(tracing_appender::non_blocking(appender))
}
