//! Fetchers and search providers for tests, available with the `test` feature.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{FetchError, FetchResult};
use crate::fetch::{FetchRequest, Fetcher};
use crate::search::{SearchCandidate, SearchProvider};
use crate::utils::defer::CallOnDrop;

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    keys: Mutex<Vec<String>>,
}

/// A [`Fetcher`] that writes `audio:{key}:{n}` after an optional delay, where `n` counts all
/// invocations of this fetcher.
///
/// Clones share their counters.
#[derive(Clone, Debug, Default)]
pub struct FakeFetcher {
    delay: Duration,
    failing: HashSet<String>,
    empty_output: bool,
    counters: Arc<Counters>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every fetch take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes fetches of `key` fail.
    pub fn failing(mut self, key: &str) -> Self {
        self.failing.insert(key.to_owned());
        self
    }

    /// Makes fetches succeed without writing any content.
    pub fn with_empty_output(mut self) -> Self {
        self.empty_output = true;
        self
    }

    /// The total number of fetches started.
    pub fn invocations(&self) -> usize {
        self.counters.invocations.load(Ordering::SeqCst)
    }

    /// The number of fetches started for `key`.
    pub fn invocations_for(&self, key: &str) -> usize {
        let keys = self.counters.keys.lock().unwrap();
        keys.iter().filter(|k| *k == key).count()
    }

    /// The highest number of fetches that were running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    async fn run(&self, request: FetchRequest<'_>) -> FetchResult<PathBuf> {
        let key = request.key.as_str();
        let n = self.counters.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.keys.lock().unwrap().push(key.to_owned());

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        let _active = {
            let counters = Arc::clone(&self.counters);
            CallOnDrop::new(move || {
                counters.active.fetch_sub(1, Ordering::SeqCst);
            })
        };

        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        if self.failing.contains(key) {
            return Err(FetchError::FetchFailed(format!("no such video: {key}")));
        }

        let contents = if self.empty_output {
            String::new()
        } else {
            format!("audio:{key}:{n}")
        };
        tokio::fs::write(request.output_path, contents).await?;
        Ok(request.output_path.to_owned())
    }
}

impl Fetcher for FakeFetcher {
    fn fetch<'a>(&'a self, request: FetchRequest<'a>) -> BoxFuture<'a, FetchResult<PathBuf>> {
        Box::pin(self.run(request))
    }
}

/// A [`SearchProvider`] answering every query with the same candidates.
#[derive(Clone, Debug, Default)]
pub struct FakeSearchProvider {
    candidates: Vec<SearchCandidate>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeSearchProvider {
    pub fn new(candidates: Vec<SearchCandidate>) -> Self {
        Self {
            candidates,
            queries: Default::default(),
        }
    }

    /// The queries received so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl SearchProvider for FakeSearchProvider {
    fn search<'a>(
        &'a self,
        query: &'a str,
        _limit: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<SearchCandidate>>> {
        self.queries.lock().unwrap().push(query.to_owned());
        let candidates = self.candidates.clone();
        Box::pin(async move { Ok(candidates) })
    }
}
