use axum::body::Body;
use axum::http::{Error as HttpError, StatusCode};
use axum::response::{IntoResponse, Response};
use jukebox_service::error::FetchError;
use sentry::integrations::anyhow::capture_anyhow;

/// A failed request.
///
/// The response only carries the status code. Details are logged and, for server errors,
/// reported to Sentry.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<FetchError> for ResponseError {
    fn from(err: FetchError) -> Self {
        // Clients never learn why a file is not available, not even for malformed keys.
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        tracing::debug!(status = %self.status, error = %self.err, "Responding with an error");

        let mut response = Body::empty().into_response();
        *response.status_mut() = self.status;
        response
    }
}
