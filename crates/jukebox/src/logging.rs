use std::env;

use jukebox_service::config::{Config, LogFormat};
use jukebox_service::logging::{json_layer, sentry_layer};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => {
            "INFO,\
             hyper=WARN,\
             reqwest=WARN"
        }
        LevelFilter::DEBUG => {
            "INFO,\
             hyper=WARN,\
             jukebox=DEBUG,\
             jukebox_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             hyper=WARN,\
             jukebox=TRACE,\
             jukebox_service=TRACE"
        }
    }
}

/// Resolves [`LogFormat::Auto`] depending on whether a user watches the output.
fn effective_format(format: LogFormat, user_attended: bool) -> LogFormat {
    match format {
        LogFormat::Auto if user_attended => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Initializes logging for jukebox.
///
/// `RUST_LOG` takes precedence over the configured level. `RUST_BACKTRACE` is switched on when
/// [`enable_backtraces`](jukebox_service::config::Logging::enable_backtraces) is set.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    let format = effective_format(config.logging.format, console::user_attended());
    let fmt_layer = match format {
        LogFormat::Json => json_layer(std::io::stdout).boxed(),
        LogFormat::Pretty | LogFormat::Auto => tracing_subscriber::fmt::layer()
            .pretty()
            .with_timer(UtcTime::rfc_3339())
            .boxed(),
        LogFormat::Simplified => tracing_subscriber::fmt::layer()
            .compact()
            .with_timer(UtcTime::rfc_3339())
            .with_ansi(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&rust_log)))
        .with(sentry_layer())
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
