//! Tracing subscriber setup.

use std::path::Path;
use std::sync::OnceLock;

use crate::error::CliError;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global subscriber.
///
/// Console output goes to stderr so stdout stays free for `--json-events`.
/// With a log directory a daily-rolling file layer is added as well.
pub fn init_logging(log_dir: Option<&Path>) -> Result<(), CliError> {
    use tracing_subscriber::prelude::*;

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                CliError::LoggingInit(format!("cannot create {}: {}", dir.display(), e))
            })?;

            let file_appender = tracing_appender::rolling::daily(dir, "slidepipe.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    // Already initialized in tests.
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}
