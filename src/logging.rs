//! Structured logging via `tracing-subscriber` and `tracing-appender`.
//!
//! The long-running `start` subcommand logs JSON to a daily-rotated file
//! and human-readable output to stderr. One-shot subcommands log to stderr
//! only.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the file, so the
/// runtime holds it until shutdown.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise logging for the long-running runtime.
///
/// JSON entries go to `{logs_dir}/armitage.log.YYYY-MM-DD` with daily
/// rotation; stderr gets human-readable output. Verbosity follows
/// `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_runtime(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("failed to create logs directory {}: {e}", logs_dir.display())
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "armitage.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise stderr-only logging for one-shot subcommands.
pub fn init_cli() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
