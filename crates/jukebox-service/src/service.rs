//! Serving fetched files.
//!
//! [`AudioService::serve`] ties the pieces together: it validates the key, joins or starts the
//! single fetch for it, waits for the file to be ready, opens it and schedules its removal.
//!
//! In `stream_close` reclaim mode the fetch resolves with one [`ReclaimGuard`] that every request
//! served from that fetch holds a clone of, so the file outlives all of their streams.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::File;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, ReclaimConfig, ReclaimMode, ServeConfig};
use crate::coordinator::{Acquisition, Coordinator, Resolver};
use crate::error::{FetchError, FetchResult};
use crate::fetch::{FetchRequest, Fetcher};
use crate::readiness::ReadinessGate;
use crate::reclaim::{FileIdentity, ReclaimGuard, Reclaimer};
use crate::storage::Storage;
use crate::types::FetchKey;

/// A file ready to be streamed to one client.
#[derive(Debug)]
pub struct ServedFile {
    filename: String,
    content_type: String,
    len: u64,
    file: File,
    guard: Option<ReclaimGuard>,
}

impl ServedFile {
    /// The name the file should be downloaded as, `{key}.{extension}`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Streams the file contents.
    ///
    /// In `stream_close` reclaim mode the file is released for removal when the stream is
    /// dropped.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let Self { file, guard, .. } = self;
        ReaderStream::new(file).map(move |chunk| {
            let _guard = &guard;
            chunk
        })
    }
}

/// What a successful fetch hands to every request waiting for it.
type Fetched = Option<ReclaimGuard>;

struct ServiceInner {
    storage: Storage,
    coordinator: Coordinator<Fetched>,
    fetcher: Arc<dyn Fetcher>,
    gate: ReadinessGate,
    reclaimer: Reclaimer,
    serve: ServeConfig,
    reclaim: ReclaimConfig,
    io_runtime: Handle,
    fetches: TaskTracker,
    cancel: CancellationToken,
}

/// Fetches keys on demand, at most once at a time per key, and serves the results.
#[derive(Clone)]
pub struct AudioService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for AudioService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioService")
            .field("storage", &self.inner.storage)
            .field("in_flight", &self.inner.coordinator.in_flight())
            .finish()
    }
}

impl AudioService {
    /// Creates the service, opening (and possibly clearing) the storage directory.
    ///
    /// Fetches and removals run on `io_runtime`.
    pub fn create(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        io_runtime: Handle,
    ) -> anyhow::Result<Self> {
        let storage = Storage::from_config(&config.storage).with_context(|| {
            format!(
                "failed to create storage directory {}",
                config.storage.dir.display()
            )
        })?;
        if config.storage.clear_on_startup {
            let removed = storage.clear().context("failed to clear storage")?;
            if removed > 0 {
                tracing::info!(removed, "Removed leftovers from storage");
            }
        }

        let inner = ServiceInner {
            storage,
            coordinator: Coordinator::new(),
            fetcher,
            gate: ReadinessGate::from_config(&config.serve),
            reclaimer: Reclaimer::new(io_runtime.clone()),
            serve: config.serve.clone(),
            reclaim: config.reclaim.clone(),
            io_runtime,
            fetches: TaskTracker::new(),
            cancel: CancellationToken::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// The number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.in_flight()
    }

    /// Materializes the file for `key` and opens it for streaming.
    #[tracing::instrument(name = "serve_audio", skip(self))]
    pub async fn serve(&self, key: &str) -> FetchResult<ServedFile> {
        let result = self.serve_inner(key).await;
        match result {
            Ok(ref served) => {
                metric!(counter("audio.served") += 1);
                metric!(time_raw("audio.size") = served.len());
            }
            Err(ref err) => {
                tracing::warn!(%err, "Failed to serve audio");
                metric!(counter("audio.failed") += 1, "reason" => err.metrics_tag());
            }
        }
        result
    }

    async fn serve_inner(&self, key: &str) -> FetchResult<ServedFile> {
        let inner = &self.inner;
        let key = FetchKey::parse(key)?;
        let path = inner.storage.path_for(&key);

        let (guard, deadline) = match inner.coordinator.acquire(&key) {
            Acquisition::Owner(resolver) => {
                tracing::debug!("Starting fetch");
                metric!(counter("audio.requests") += 1, "role" => "owner");
                // The fetch runs detached so a disconnecting client cannot abort it for the
                // requests waiting on it.
                let handle = resolver.handle();
                self.spawn_fetch(resolver, path.clone());
                (handle.wait().await?, None)
            }
            Acquisition::Waiter(handle) => {
                tracing::debug!("Joining running fetch");
                metric!(counter("audio.requests") += 1, "role" => "waiter");
                let timeout = inner.serve.wait_timeout;
                let deadline = tokio::time::Instant::now() + timeout;
                let guard = tokio::time::timeout_at(deadline, handle.wait())
                    .await
                    .map_err(|_| FetchError::Timeout(timeout))??;
                (guard, Some(deadline))
            }
        };

        self.await_file(&path, deadline).await?;
        self.open(&key, path, guard).await
    }

    /// Runs the readiness gate on a file whose fetch succeeded.
    ///
    /// Waiters share `deadline` with their wait for the fetch. A file that does not show up
    /// within the gate's own bound has been removed and is reported as not available.
    async fn await_file(
        &self,
        path: &Path,
        deadline: Option<tokio::time::Instant>,
    ) -> FetchResult<u64> {
        let inner = &self.inner;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining < inner.serve.ready_timeout {
                return inner
                    .gate
                    .wait_at_most(path, remaining)
                    .await
                    .map_err(|err| match err {
                        FetchError::Timeout(_) => FetchError::Timeout(inner.serve.wait_timeout),
                        err => err,
                    });
            }
        }

        inner.gate.wait(path).await.map_err(|err| match err {
            FetchError::Timeout(_) => FetchError::NotAvailable(format!(
                "{} is gone after its fetch completed",
                path.display()
            )),
            err => err,
        })
    }

    async fn open(
        &self,
        key: &FetchKey,
        path: PathBuf,
        shared_guard: Fetched,
    ) -> FetchResult<ServedFile> {
        let inner = &self.inner;
        let not_available = |err: io::Error| FetchError::NotAvailable(err.to_string());

        let file = File::open(&path).await.map_err(not_available)?;
        let meta = file.metadata().await.map_err(not_available)?;
        if meta.len() == 0 {
            return Err(FetchError::NotAvailable(format!(
                "{} is empty",
                path.display()
            )));
        }

        let guard = match inner.reclaim.mode {
            ReclaimMode::Elapsed => {
                let identity = Some(FileIdentity::from_metadata(&meta));
                inner
                    .reclaimer
                    .schedule_cleanup_of(path, identity, inner.reclaim.grace_period);
                None
            }
            ReclaimMode::StreamClose => shared_guard,
        };

        Ok(ServedFile {
            filename: inner.storage.filename(key),
            content_type: inner.serve.content_type.clone(),
            len: meta.len(),
            file,
            guard,
        })
    }

    fn spawn_fetch(&self, resolver: Resolver<Fetched>, path: PathBuf) {
        let inner = Arc::clone(&self.inner);
        let task = async move {
            let result = match inner.run_fetch(resolver.key(), &path).await {
                Ok(()) => Ok(inner.shared_guard(&path).await),
                Err(err) => Err(err),
            };
            resolver.resolve(result);
            metric!(gauge("fetch.in_flight") = inner.coordinator.in_flight() as u64);
        };
        self.inner.fetches.spawn_on(task, &self.inner.io_runtime);
        metric!(gauge("fetch.in_flight") = self.in_flight() as u64);
    }

    /// Cancels running fetches, runs pending removals and waits for both.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.fetches.close();
        inner.fetches.wait().await;
        inner.reclaimer.shutdown().await;
    }
}

impl ServiceInner {
    /// Creates the guard shared by all requests served from one fetch, in `stream_close` mode.
    async fn shared_guard(&self, path: &Path) -> Fetched {
        match self.reclaim.mode {
            ReclaimMode::Elapsed => None,
            ReclaimMode::StreamClose => {
                let identity = tokio::fs::metadata(path)
                    .await
                    .ok()
                    .map(|meta| FileIdentity::from_metadata(&meta));
                Some(self.reclaimer.guard(path.to_owned(), identity, self.reclaim.max_age))
            }
        }
    }

    #[tracing::instrument(name = "fetch_audio", skip_all, fields(%key))]
    async fn run_fetch(&self, key: &FetchKey, path: &Path) -> FetchResult {
        let start = Instant::now();
        let result = self.fetch_into(key, path).await;
        let outcome = match result {
            Ok(()) => {
                tracing::info!(elapsed = ?start.elapsed(), "Fetched audio");
                "ok"
            }
            Err(ref err) => {
                tracing::warn!(%err, "Fetch failed");
                err.metrics_tag()
            }
        };
        metric!(timer("fetch.duration") = start.elapsed(), "result" => outcome);
        result
    }

    async fn fetch_into(&self, key: &FetchKey, path: &Path) -> FetchResult {
        let staging = self.storage.staging(key)?;
        let request = FetchRequest {
            key,
            output_template: staging.output_template(),
            output_path: staging.output_path(),
            cancel: &self.cancel,
        };
        let produced = self.fetcher.fetch(request).await?;

        match tokio::fs::metadata(&produced).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                return Err(FetchError::FetchFailed(format!(
                    "empty output at {}",
                    produced.display()
                )));
            }
            Err(err) => {
                return Err(FetchError::FetchFailed(format!(
                    "no output at {}: {err}",
                    produced.display()
                )));
            }
        }

        staging.promote(&produced, path).await?;
        Ok(())
    }
}
