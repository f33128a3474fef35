use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Log to stdout and to a daily file in the cache directory.
///
/// Keep the returned guard alive for as long as the process should log to the
/// file.
pub fn init_logging(cfg: &AppConfig, file_name: &str) -> std::io::Result<Option<WorkerGuard>> {
    if start_console(cfg) {
        return Ok(None);
    }

    std::fs::create_dir_all(&cfg.cache_path)?;
    let file_appender = rolling::daily(&cfg.cache_path, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .try_init();
    if installed.is_err() {
        // Already installed by an earlier call in this process.
        return Ok(None);
    }
    Ok(Some(guard))
}

#[cfg(feature = "tokio-console")]
fn start_console(cfg: &AppConfig) -> bool {
    if cfg.debug_console {
        console_subscriber::init();
    }
    cfg.debug_console
}

#[cfg(not(feature = "tokio-console"))]
fn start_console(_cfg: &AppConfig) -> bool {
    false
}
