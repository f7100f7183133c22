use std::io;
use std::path::Path;
use std::time::Duration;

use crate::config::ServeConfig;
use crate::error::{FetchError, FetchResult};

/// Waits for a file produced by someone else to become usable.
///
/// A file is considered ready once it exists and is non-empty. Size is the only completeness
/// signal, which is sound because fetched files are moved into place with a single rename.
#[derive(Clone, Copy, Debug)]
pub struct ReadinessGate {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl ReadinessGate {
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(config: &ServeConfig) -> Self {
        Self::new(config.poll_interval, Some(config.ready_timeout))
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits until `path` is ready and returns its size.
    pub async fn wait(&self, path: &Path) -> FetchResult<u64> {
        wait_until_ready(path, self.poll_interval, self.timeout).await
    }

    /// Like [`wait`](Self::wait), but gives up after `limit` if that comes first.
    pub async fn wait_at_most(&self, path: &Path, limit: Duration) -> FetchResult<u64> {
        let timeout = match self.timeout {
            Some(timeout) => timeout.min(limit),
            None => limit,
        };
        wait_until_ready(path, self.poll_interval, Some(timeout)).await
    }
}

/// Polls `path` every `poll_interval` until it is a non-empty file, and returns its size.
///
/// Without a `timeout` this waits indefinitely.
pub async fn wait_until_ready(
    path: &Path,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> FetchResult<u64> {
    let poll = async {
        loop {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => return Ok(meta.len()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(FetchError::NotAvailable(err.to_string())),
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?,
        None => poll.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_ready_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        std::fs::write(&path, b"ID3").unwrap();

        let len = wait_until_ready(&path, POLL, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(len, 3);
    }

    #[tokio::test]
    async fn test_waits_for_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123.mp3");
        std::fs::write(&path, b"").unwrap();

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(&path, b"payload").await.unwrap();
            })
        };

        let gate = ReadinessGate::new(POLL, Some(Duration::from_secs(5)));
        assert_eq!(gate.wait(&path).await.unwrap(), 7);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mp3");

        let timeout = Duration::from_millis(50);
        let result = wait_until_ready(&path, POLL, Some(timeout)).await;
        assert_eq!(result, Err(FetchError::Timeout(timeout)));
    }

    #[tokio::test]
    async fn test_wait_at_most() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mp3");
        let gate = ReadinessGate::new(POLL, Some(Duration::from_secs(60)));

        let limit = Duration::from_millis(50);
        assert_eq!(
            gate.wait_at_most(&path, limit).await,
            Err(FetchError::Timeout(limit))
        );

        std::fs::write(&path, b"ID3").unwrap();
        assert_eq!(gate.wait_at_most(&path, limit).await, Ok(3));
    }

    #[tokio::test]
    async fn test_directory_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();

        let result = wait_until_ready(dir.path(), POLL, Some(Duration::from_millis(30))).await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
