use crate::models::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: human-readable stdout plus a daily JSON
/// file. The returned guard flushes the file writer and must outlive `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    // Create logs directory
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("cannot create log directory {}", config.directory.display()))?;

    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(config.ansi),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .json(),
        )
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    info!("Logging initialized ({})", config.directory.display());
    Ok(guard)
}
