//! Logging initialisation.
//!
//! Human-readable output always goes to stderr, filtered by `RUST_LOG`
//! (default `info`). When a log directory is given, either explicitly or
//! through `APPLIANCE_BUILDER_LOG_DIR`, a daily-rotated plain-text copy is
//! written there as well.
//!
//! Keep the returned guard alive until exit so buffered lines are flushed.

use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_DIR_ENV: &str = "APPLIANCE_BUILDER_LOG_DIR";

const LOG_FILE_PREFIX: &str = "appliance-builder.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    file_dir: Option<PathBuf>,
}

impl LogGuard {
    /// Directory the log file is written to, if any.
    pub fn file_dir(&self) -> Option<&Path> {
        self.file_dir.as_deref()
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber. Call once from `main`.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let dir = log_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(LOG_DIR_ENV).map(PathBuf::from));

    let Some(dir) = dir.filter(|d| std::fs::create_dir_all(d).is_ok()) else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return LogGuard {
            _file_guard: None,
            file_dir: None,
        };
    };

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: Some(guard),
        file_dir: Some(dir),
    }
}

/// Default place for log files when the user asks for them without a path.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("appliance-builder")
        .join("logs")
}
