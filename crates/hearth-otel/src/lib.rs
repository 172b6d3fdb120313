use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// Console output is always on and filtered by `RUST_LOG` (default `info`).
/// When `HEARTH_LOG_DIR` is set, a second non-ANSI layer writes rolling files
/// there; `HEARTH_LOG_ROTATION` picks `hourly`, `minutely` or `daily` (default).
/// Calling this more than once is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(dir) = std::env::var("HEARTH_LOG_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
    else {
        let _ = registry.try_init();
        return;
    };

    if std::fs::create_dir_all(&dir).is_err() {
        let _ = registry.try_init();
        tracing::warn!(directory = %dir, "failed to create log directory; console only");
        return;
    }
    let prefix = std::env::var("HEARTH_LOG_PREFIX").unwrap_or_else(|_| "hearth".into());
    let rotation = std::env::var("HEARTH_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    let writer = match rotation.to_ascii_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
        "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
        _ => tracing_appender::rolling::daily(&dir, &prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    let _ = registry.with(file_layer).try_init();
}
