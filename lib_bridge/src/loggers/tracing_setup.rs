//! # Setup Logging
//!
//! Installs the global `tracing` subscriber:
//!
//! - an `EnvFilter` taken from `RUST_LOG`, else from the configured level,
//! - a human-readable console layer with targets and ANSI colors,
//! - a JSON file layer on a daily-rolling, non-blocking appender.
//!
//! The returned [`WorkerGuard`] flushes the file appender when dropped; keep it alive in `main`.

use std::path::PathBuf;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{BridgeError, Result};

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `lib_bridge=debug,info`.
    pub level: String,
    /// Directory of the rolling log files. Created when missing.
    pub dir: PathBuf,
    /// File name prefix; the date is appended by the appender.
    pub file_prefix: String,
    /// Also log to stdout.
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".into(),
            dir: PathBuf::from("logs"),
            file_prefix: "bridge".into(),
            console: true,
        }
    }
}

/// `RUST_LOG` wins over the configured level; an unparsable level falls back to `info`.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// # Setup Logging
///
/// # Errors
/// `Io` when the log directory cannot be created, `Config` when a global subscriber is
/// already installed.
pub fn setup_logging(options: &LogOptions) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&options.dir)?;

    let file_appender = rolling::daily(&options.dir, &options.file_prefix);
    let (writer, guard) = non_blocking(file_appender);

    let console_layer = options.console.then(|| fmt::layer().with_target(true).with_ansi(true));
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer).json();

    tracing_subscriber::registry()
        .with(build_filter(&options.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logging already initialized: {}", e)))?;

    info!(level = %options.level, dir = %options.dir.display(), "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_creates_directory_and_writes_json() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/logs");
        let options = LogOptions {
            dir: dir.clone(),
            file_prefix: "unit".into(),
            console: false,
            ..Default::default()
        };

        let guard = setup_logging(&options).unwrap();
        tracing::warn!(device = "AA:BB", "probe event");
        drop(guard);

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].path()).unwrap();
        let line = content.lines().find(|l| l.contains("probe event")).unwrap();
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["fields"]["device"], "AA:BB");

        assert!(matches!(setup_logging(&options), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_invalid_level_falls_back() {
        // Must not panic on garbage directives.
        let _ = build_filter("not a [valid] directive ===");
    }
}
