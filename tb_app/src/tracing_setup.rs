use std::io;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Initialise tracing on stderr, plus a daily rolling file when `log_dir` is set
///
/// Stdout is left alone since the gate writes its responses there. The
/// returned guard flushes the file writer on drop and must be held by `main`.
pub fn init(app_name: &str, log_dir: Option<&str>, default_level: Level) -> Option<WorkerGuard> {
    // Respects RUST_LOG env var, falls back to default_level
    let env_filter = EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy();

    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(true).with_thread_ids(true).with_line_number(true).compact();

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);

            // Background thread handles all file I/O
            let file_appender = tracing_appender::rolling::daily(dir, format!("{app_name}.log"));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer =
                fmt::layer().with_writer(non_blocking).with_target(true).with_thread_ids(true).with_line_number(true).with_ansi(false).compact();

            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(env_filter).with(stderr_layer).with(file_layer).init();

    guard
}
