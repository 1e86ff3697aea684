use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

/// Configure the global logger.
///
/// `RUST_LOG` takes precedence over `default_level`. Panics if a global
/// subscriber has already been set, use `try_configure_global_logger` when
/// that's expected (e.g. from tests).
pub fn configure_global_logger(default_level: tracing::Level, format: LogFormat) {
    if let Err(e) = try_configure_global_logger(default_level, format) {
        panic!("failed to set global subscriber: {e}");
    }
}

/// Like `configure_global_logger` but returns an error if a subscriber is
/// already set.
pub fn try_configure_global_logger(
    default_level: tracing::Level,
    format: LogFormat,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::HumanReadable => {
            let subscriber = builder.finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Json => {
            let subscriber = builder.json().finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    }
}

/// Configure a logger that writes through the test harness so output is only
/// shown for failing tests.
///
/// Safe to call from multiple tests, only the first call installs the
/// subscriber.
pub fn configure_test_logger() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_test_writer()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .finish();

    // Another test already installed it.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
