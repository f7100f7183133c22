use axum::Json;
use axum::extract::{Query, State};
use jukebox_service::search::{InlineAudioResult, inline_results};
use serde::Deserialize;

use super::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    q: String,
}

/// Answers a free-text search with links to `/audio/{key}`.
///
/// Always succeeds. Failures of the search program result in an empty list.
pub async fn search_audio(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<InlineAudioResult>> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /search"));
    });

    let Some(search) = state.search else {
        return Json(Vec::new());
    };

    let results = inline_results(
        search.provider.as_ref(),
        &params.q,
        &search.base_url,
        search.limit,
    )
    .await;
    Json(results)
}

#[cfg(test)]
mod tests {
    use jukebox_service::search::SearchCandidate;
    use jukebox_service::test::{FakeFetcher, FakeSearchProvider};
    use reqwest::StatusCode;
    use serde_json::{Value, json};

    use crate::test;

    fn candidate(id: Option<&str>, title: &str, artists: &[&str]) -> SearchCandidate {
        SearchCandidate {
            id: id.map(String::from),
            title: Some(title.to_owned()),
            artists: artists.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_search() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let provider = FakeSearchProvider::new(vec![
            candidate(Some("abc123"), "Song", &["Alice", "Bob"]),
            candidate(None, "Unplayable", &[]),
            candidate(Some("def456"), "Other song", &[]),
        ]);
        let server = test::server_with_search(dir.path(), &provider);

        let response = reqwest::get(server.url("/search?q=%20song%20"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();

        assert_eq!(
            results,
            json!([
                {
                    "id": "0",
                    "audio_url": "http://jukebox.test/audio/abc123",
                    "title": "Song",
                    "performer": "Alice, Bob",
                },
                {
                    "id": "2",
                    "audio_url": "http://jukebox.test/audio/def456",
                    "title": "Other song",
                    "performer": "Unknown",
                },
            ])
        );
        assert_eq!(provider.queries(), ["song"]);
    }

    #[tokio::test]
    async fn test_empty_query() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let provider = FakeSearchProvider::new(vec![candidate(Some("abc123"), "Song", &[])]);
        let server = test::server_with_search(dir.path(), &provider);

        for path in ["/search", "/search?q=", "/search?q=%20%20"] {
            let response = reqwest::get(server.url(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), "[]");
        }
        assert!(provider.queries().is_empty());
    }

    #[tokio::test]
    async fn test_search_disabled() {
        jukebox_test::setup();
        let dir = jukebox_test::tempdir();
        let (server, _service) = test::server_with_fetcher(dir.path(), &FakeFetcher::new());

        let response = reqwest::get(server.url("/search?q=song")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "[]");
    }
}
