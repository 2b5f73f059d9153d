//! Subscriber setup: text or JSON, to stderr or a daily-rolled file.

use sharecrawl_core::{LogFormat, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()))
    };

    if let Some((dir, name)) = config.file.as_deref().and_then(split_log_path) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Failed to create log directory: {}", e);
            eprintln!("Falling back to stderr logging");
        } else {
            let file_appender = tracing_appender::rolling::daily(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            match config.format {
                LogFormat::Json => tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter())
                    .with_writer(non_blocking)
                    .with_current_span(true)
                    .with_span_list(true)
                    .init(),
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(filter())
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .init(),
            }
            return Some(guard);
        }
    }

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init(),
    }
    None
}

fn split_log_path(path: &std::path::Path) -> Option<(&std::path::Path, std::ffi::OsString)> {
    let name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => std::path::Path::new("."),
    };
    Some((dir, name))
}
