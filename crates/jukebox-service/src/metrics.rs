//! Statsd metrics.
//!
//! Nothing is reported until [`configure_statsd`] has been called. Until then, and when statsd is
//! not configured at all, the [`metric!`](crate::metric) macro is a no-op.

use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, MetricSink, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that adds a fixed set of tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    fn new<S>(prefix: &str, sink: S, default_tags: BTreeMap<String, String>) -> Self
    where
        S: MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            statsd: StatsdClient::from_sink(prefix, sink),
            default_tags,
        }
    }

    /// The underlying client, used to start building a metric.
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the default tags and sends the metric, dropping it on error.
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        let metric = self
            .default_tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value));
        if let Err(err) = metric.try_send() {
            tracing::trace!(%err, "Failed to send metric");
        }
    }
}

/// Reports all metrics to the statsd server at `host`, prefixed with `prefix`.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let addr = addrs.first().context("statsd host has no addresses")?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(*addr, socket)?;

    if CLIENT.set(MetricsClient::new(prefix, sink, tags)).is_err() {
        tracing::warn!("Statsd was already configured");
    } else {
        tracing::info!(%addr, prefix, "Reporting metrics to statsd");
    }
    Ok(())
}

/// Runs `f` with the configured client, or does nothing when there is none.
#[doc(hidden)]
#[inline]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("audio.requests") += 1, "role" => "owner");
/// metric!(gauge("fetch.in_flight") = 3);
/// metric!(timer("fetch.duration") = started.elapsed());
/// metric!(time_raw("audio.size") = len);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    // Sizes and counts are sent as timers to get percentiles.
    (time_raw($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        #[allow(unused_imports)]
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
