use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogSettings;

/// Filter from `RUST_LOG`, else the configured level.
fn filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&settings.level))
}

/// The configured directive, or `info` when it does not parse.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stderr always, plus a daily rolling
/// file when a log directory is configured.
///
/// Keep the returned guard alive until exit so buffered file output is
/// flushed.
pub fn init(settings: &LogSettings) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter(settings))
        .with(stderr)
        .with(file)
        .try_init();

    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
    if let Some(dir) = &settings.directory {
        tracing::info!("Writing logs to {}", dir.display());
    }
    guard
}
