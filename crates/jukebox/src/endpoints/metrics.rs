use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::{Request, Response, StatusCode};
use jukebox_service::metric;
use tower_layer::Layer;
use tower_service::Service as TowerService;

/// Reports duration and status code of every request, tagged with the matched route.
#[derive(Clone, Debug)]
pub struct MetricsLayer;

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
}

pub struct MetricsFuture<F> {
    route: String,
    start: Instant,
    future: Pin<Box<F>>,
}

impl<F, B, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = this.future.as_mut().poll(cx);
        if let Poll::Ready(ref result) = poll {
            let status = result
                .as_ref()
                .map(|response| response.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            metric!(
                timer("requests.duration") = this.start.elapsed(),
                "route" => &this.route,
            );
            metric!(
                counter("responses.status_code") += 1,
                "status" => status.as_str(),
                "route" => &this.route,
            );
        }
        poll
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

impl<S, B, ResBody> TowerService<Request<B>> for MetricsService<S>
where
    S: TowerService<Request<B>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or("unmatched", MatchedPath::as_str)
            .to_owned();
        metric!(counter("requests.started") += 1, "route" => &route);

        MetricsFuture {
            route,
            start: Instant::now(),
            future: Box::pin(self.inner.call(request)),
        }
    }
}
