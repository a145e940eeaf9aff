use genefetch_service::config::Config;
use genefetch_service::logging;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes logging for genefetch.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in
/// the configuration. Pretty output is only used if a human watches `stderr`.
pub fn init_logging(config: &Config) {
    let filter = logging::env_filter(&config.logging);
    logging::subscriber(
        &config.logging,
        filter,
        std::io::stderr,
        console::user_attended_stderr(),
    )
    .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
