use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> String {
    match level {
        LevelFilter::OFF => "off".into(),
        LevelFilter::ERROR | LevelFilter::WARN | LevelFilter::INFO => level.to_string(),
        // only turn up our own verbosity, dependencies stay at INFO
        _ => format!("INFO,batcher={level}"),
    }
}

/// Initializes logging for the process.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration. Events are also forwarded to Sentry, which turns errors into Sentry events
/// and everything else into breadcrumbs.
///
/// Fails if a global subscriber has already been installed.
pub fn init_logging(config: &Logging) -> Result<(), TryInitError> {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level));

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match (config.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .boxed(),
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry::integrations::tracing::layer())
        .try_init()
}
