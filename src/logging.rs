//! Tracing subscriber setup for the CLI.
//!
//! The filter comes from `COACHSYNC_LOG` (default `info`). Output goes to a
//! daily rolling file under the data directory, since stdout belongs to
//! command output.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "COACHSYNC_LOG";

/// Directory for daily log files (default: $XDG_DATA_HOME/coachsync/logs).
pub fn default_log_dir() -> PathBuf {
  dirs::data_dir()
    .map(|d| d.join("coachsync").join("logs"))
    .unwrap_or_else(|| PathBuf::from(".coachsync/logs"))
}

/// Install the global subscriber.
///
/// Logs go to a daily rolling file in `log_dir`, or to stderr when the file
/// cannot be created. Keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn setup_logging(log_dir: &Path) -> WorkerGuard {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let appender = std::fs::create_dir_all(log_dir)
    .ok()
    .and_then(|_| {
      RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("coachsync")
        .filename_suffix("log")
        .build(log_dir)
        .ok()
    });

  // Try the log file, fall back to stderr
  match appender {
    Some(appender) => {
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      guard
    }
    None => {
      let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .init();
      guard
    }
  }
}
