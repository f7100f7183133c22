//! Building blocks for the `tracing` subscriber.

use sentry::integrations::tracing::EventFilter;
use tracing::{Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::registry::LookupSpan;

/// A layer writing one flattened JSON object per event, including the span list.
pub fn json_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(make_writer)
}

/// A layer forwarding errors to Sentry as events and info and warnings as logs.
pub fn sentry_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    })
}
