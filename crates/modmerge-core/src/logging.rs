use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to `<log_dir>/modmerge.log` and stdout.
/// `RUST_LOG` overrides the default level (`info`, or `debug` when
/// `verbose`). Hold the returned guard for the lifetime of the process so
/// buffered lines reach the file.
pub fn init_logging(
    log_dir: &Path,
    verbose: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::never(log_dir, "modmerge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let default_level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false),
        )
        .try_init()?;

    Ok(guard)
}
