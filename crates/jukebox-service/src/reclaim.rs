//! Deferred, best-effort removal of served files.
//!
//! Reclaims run as tracked background tasks, independent of the request that scheduled them.
//! Failures are logged and never reported back.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Identifies one incarnation of a file at a path.
///
/// A later fetch cycle for the same key renames a new file over the old path, which changes the
/// identity. Reclaims scheduled by the earlier cycle then leave the new file alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileIdentity {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileIdentity {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(meta),
        }
    }
}

/// Keeps a file alive in `stream_close` mode.
///
/// Clones share the file. It is released to the reclaimer once the last clone is dropped.
#[derive(Clone, Debug)]
pub struct ReclaimGuard {
    _closed: Arc<oneshot::Sender<()>>,
}

/// Schedules and runs deferred deletions.
#[derive(Clone, Debug)]
pub struct Reclaimer {
    runtime: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Reclaimer {
    /// Creates a reclaimer that runs its tasks on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Deletes `path` after `delay`.
    ///
    /// The identity of the file is captured before this returns; if the path has been replaced
    /// by the time the delay expires, it is not deleted.
    pub async fn schedule_cleanup(&self, path: PathBuf, delay: Duration) {
        let identity = tokio::fs::metadata(&path)
            .await
            .ok()
            .map(|meta| FileIdentity::from_metadata(&meta));
        self.schedule_cleanup_of(path, identity, delay);
    }

    /// Deletes `path` after `delay`, provided it still has the given identity.
    pub fn schedule_cleanup_of(
        &self,
        path: PathBuf,
        identity: Option<FileIdentity>,
        delay: Duration,
    ) {
        tracing::debug!(path = %path.display(), ?delay, "Scheduling file removal");
        let shutdown = self.shutdown.clone();
        let task = async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            reclaim(&path, identity).await;
        };
        self.tracker.spawn_on(task, &self.runtime);
    }

    /// Deletes `path` once the returned guard and all its clones are dropped, or after `max_age`
    /// at the latest.
    pub fn guard(
        &self,
        path: PathBuf,
        identity: Option<FileIdentity>,
        max_age: Duration,
    ) -> ReclaimGuard {
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let shutdown = self.shutdown.clone();
        let task = async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = closed_rx => {
                    tracing::trace!(path = %path.display(), "Stream closed");
                }
                _ = tokio::time::sleep(max_age) => {
                    tracing::debug!(path = %path.display(), "Stream outlived the maximum age");
                }
            }
            reclaim(&path, identity).await;
        };
        self.tracker.spawn_on(task, &self.runtime);

        ReclaimGuard {
            _closed: Arc::new(closed_tx),
        }
    }

    /// The number of reclaims that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Runs all pending reclaims immediately and waits for them to finish.
    pub async fn shutdown(&self) {
        let pending = self.pending();
        if pending > 0 {
            tracing::info!(pending, "Running pending file removals");
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn reclaim(path: &Path, identity: Option<FileIdentity>) {
    if let Some(expected) = identity {
        match tokio::fs::metadata(path).await {
            Ok(meta) if FileIdentity::from_metadata(&meta) != expected => {
                tracing::debug!(path = %path.display(), "File was replaced, not removing");
                metric!(counter("reclaim.skipped") += 1);
                return;
            }
            // removal below reports anything interesting
            Ok(_) | Err(_) => {}
        }
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed served file");
            metric!(counter("reclaim.removed") += 1);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Served file was already removed");
        }
        Err(err) => {
            let error: &dyn std::error::Error = &err;
            tracing::error!(error, path = %path.display(), "Failed to remove served file");
            metric!(counter("reclaim.failed") += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &[u8]) -> FileIdentity {
        std::fs::write(path, contents).unwrap();
        FileIdentity::from_metadata(&std::fs::metadata(path).unwrap())
    }

    #[tokio::test]
    async fn test_removes_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        write(&path, b"payload");

        let reclaimer = Reclaimer::new(Handle::current());
        reclaimer
            .schedule_cleanup(path.clone(), Duration::from_millis(200))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists(), "removed before the grace period");
        assert_eq!(reclaimer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!path.exists());
        assert_eq!(reclaimer.pending(), 0);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.mp3");

        let reclaimer = Reclaimer::new(Handle::current());
        reclaimer
            .schedule_cleanup(path.clone(), Duration::from_millis(10))
            .await;
        reclaimer.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_skips_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        let identity = write(&path, b"first cycle");

        let reclaimer = Reclaimer::new(Handle::current());
        reclaimer.schedule_cleanup_of(path.clone(), Some(identity), Duration::from_millis(100));

        // a later cycle renames a fresh file over the same path
        let fresh = dir.path().join("fresh");
        write(&fresh, b"second cycle!");
        std::fs::rename(&fresh, &path).unwrap();

        reclaimer.shutdown().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"second cycle!");
    }

    #[tokio::test]
    async fn test_guard_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        let identity = write(&path, b"payload");

        let reclaimer = Reclaimer::new(Handle::current());
        let guard = reclaimer.guard(path.clone(), Some(identity), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists());

        drop(guard);
        reclaimer.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_guard_clones_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        let identity = write(&path, b"payload");

        let reclaimer = Reclaimer::new(Handle::current());
        let first = reclaimer.guard(path.clone(), Some(identity), Duration::from_secs(600));
        let second = first.clone();

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(path.exists(), "removed while a clone was alive");
        assert_eq!(reclaimer.pending(), 1);

        drop(second);
        tokio::time::timeout(Duration::from_secs(5), async {
            while reclaimer.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_guard_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        let identity = write(&path, b"payload");

        let reclaimer = Reclaimer::new(Handle::current());
        let _guard = reclaimer.guard(path.clone(), Some(identity), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_runs_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        write(&path, b"payload");

        let reclaimer = Reclaimer::new(Handle::current());
        reclaimer
            .schedule_cleanup(path.clone(), Duration::from_secs(3600))
            .await;

        tokio::time::timeout(Duration::from_secs(5), reclaimer.shutdown())
            .await
            .unwrap();
        assert!(!path.exists());
    }
}
