//! Subscriber setup driven by the [`Logging`] configuration.

use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, Logging};

/// The directives used for `level` when `RUST_LOG` is not set.
///
/// The FTP client and the HTTP connection pool are chatty, so they stay one level quieter
/// than genefetch itself.
pub fn default_directives(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN,suppaftp=ERROR",
        LevelFilter::INFO => "INFO,suppaftp=WARN,hyper_util=WARN",
        LevelFilter::DEBUG => "INFO,suppaftp=WARN,genefetch=DEBUG,genefetch_service=DEBUG",
        LevelFilter::TRACE => "INFO,suppaftp=DEBUG,genefetch=TRACE,genefetch_service=TRACE",
    }
}

/// The filter for `config`, unless `RUST_LOG` overrides it.
pub fn env_filter(config: &Logging) -> EnvFilter {
    match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => EnvFilter::new(default_directives(config.level)),
    }
}

/// Builds the subscriber for `config`, writing to `make_writer`.
///
/// [`LogFormat::Auto`] picks the pretty format if `attended` and the simplified one
/// otherwise. Errors become sentry events, warnings and infos are attached to them as
/// breadcrumbs.
pub fn subscriber<W>(
    config: &Logging,
    filter: EnvFilter,
    make_writer: W,
    attended: bool,
) -> impl Subscriber + Send + Sync + for<'span> LookupSpan<'span>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(make_writer)
        .with_target(true);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match (config.format, attended) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .with(sentry_layer)
}
