use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::Response;

use super::{AppState, ResponseError};

/// Serves the audio file for `key`, fetching it first unless another request already does.
pub async fn get_audio(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /audio"));
    });

    let served = state.audio.serve(&key).await?;
    let disposition = format!("attachment; filename=\"{}\"", served.filename());

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, served.content_type())
        .header(header::CONTENT_LENGTH, served.len())
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(served.into_stream()))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jukebox_service::test::FakeFetcher;
    use reqwest::StatusCode;

    use crate::test;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_fetch() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let fetcher = FakeFetcher::new().with_delay(Duration::from_millis(200));
        let (server, _service) = test::server_with_fetcher(dir.path(), &fetcher);

        let client = reqwest::Client::new();
        let url = server.url("/audio/abc123");
        let (first, second) = tokio::join!(client.get(url.clone()).send(), client.get(url).send());
        let (first, second) = (first.unwrap(), second.unwrap());

        for response in [&first, &second] {
            assert_eq!(response.status(), StatusCode::OK);
            let headers = response.headers();
            assert_eq!(headers["content-type"], "audio/mpeg");
            assert_eq!(headers["content-length"], "14");
            assert_eq!(
                headers["content-disposition"],
                "attachment; filename=\"abc123.mp3\""
            );
        }

        let first = first.bytes().await.unwrap();
        let second = second.bytes().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first[..], b"audio:abc123:1");
        assert_eq!(fetcher.invocations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_fetch() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let fetcher = FakeFetcher::new()
            .with_delay(Duration::from_millis(100))
            .failing("bad000");
        let (server, service) = test::server_with_fetcher(dir.path(), &fetcher);

        let client = reqwest::Client::new();
        let url = server.url("/audio/bad000");
        let (first, second) = tokio::join!(client.get(url.clone()).send(), client.get(url).send());

        for response in [first.unwrap(), second.unwrap()] {
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(response.bytes().await.unwrap().is_empty());
        }
        assert_eq!(fetcher.invocations(), 1);
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_keys() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let fetcher = FakeFetcher::new().with_delay(Duration::from_millis(200));
        let (server, _service) = test::server_with_fetcher(dir.path(), &fetcher);

        let client = reqwest::Client::new();
        let (k1, k2) = tokio::join!(
            client.get(server.url("/audio/k1")).send(),
            client.get(server.url("/audio/k2")).send(),
        );

        let k1 = k1.unwrap().text().await.unwrap();
        let k2 = k2.unwrap().text().await.unwrap();
        assert!(k1.starts_with("audio:k1:"), "{k1}");
        assert!(k2.starts_with("audio:k2:"), "{k2}");
        assert_eq!(fetcher.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn test_invalid_key() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let fetcher = FakeFetcher::new();
        let (server, _service) = test::server_with_fetcher(dir.path(), &fetcher);

        let response = reqwest::get(server.url("/audio/abc.mp3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.bytes().await.unwrap().is_empty());
        assert_eq!(fetcher.invocations(), 0);
    }

    #[tokio::test]
    async fn test_healthcheck() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let (server, _service) = test::server_with_fetcher(dir.path(), &FakeFetcher::new());

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
