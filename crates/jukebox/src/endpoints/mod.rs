use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use jukebox_service::metric;
use jukebox_service::search::SearchProvider;
use jukebox_service::service::AudioService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod audio;
mod error;
mod metrics;
mod search;

pub use error::ResponseError;
use metrics::MetricsLayer;

use audio::get_audio as audio;
use search::search_audio as search;

/// Everything needed to answer search requests.
#[derive(Clone)]
pub struct SearchState {
    pub provider: Arc<dyn SearchProvider>,
    /// The base URL audio links point to.
    pub base_url: String,
    pub limit: usize,
}

impl std::fmt::Debug for SearchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchState")
            .field("base_url", &self.base_url)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// The state shared by all request handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub audio: AudioService,
    /// `None` if search is disabled.
    pub search: Option<SearchState>,
}

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(state: AppState) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/audio/{key}", get(audio))
        .route("/search", get(search))
        .with_state(state)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
