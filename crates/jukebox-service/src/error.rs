use std::time::Duration;

use thiserror::Error;

/// An error that happens while materializing or serving a file for a key.
///
/// All variants are local to the request that triggered or waited on the failed fetch. None of
/// them are ever persisted: the next request for the same key starts from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The requested key cannot be used as a file name.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The fetch program failed, or did not produce a non-empty file.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// Gave up waiting for a fetch started by another request, or for its file.
    #[error("gave up waiting after {0:?}")]
    Timeout(Duration),
    /// The fetch was cancelled because the service is shutting down.
    #[error("fetch cancelled")]
    Cancelled,
    /// The fetching task went away without reporting a result.
    #[error("fetch abandoned")]
    Abandoned,
    /// The fetched file could not be opened or disappeared before it was served.
    #[error("not available: {0}")]
    NotAvailable(String),
    /// An unexpected error in jukebox itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for FetchError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl FetchError {
    /// Logs `e` and turns it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name of the variant, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "invalid_key",
            Self::FetchFailed(_) => "fetch_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
            Self::NotAvailable(_) => "not_available",
            Self::InternalError => "internal",
        }
    }
}

/// The outcome of a fetch or serve operation.
pub type FetchResult<T = ()> = Result<T, FetchError>;
