use std::time::Duration;

use thiserror::Error;

/// An error that happens while loading a subject from the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The backing store failed to fetch the subject.
    ///
    /// The attached string contains the store's error message.
    #[error("storage error: {0}")]
    Storage(String),
    /// The backing store finished, but no entry was created in the cache.
    #[error("no entry was produced")]
    Missing,
    /// The load task ended without reporting a result, for example because it panicked or the
    /// runtime it was running on shut down.
    #[error("load task aborted")]
    Aborted,
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl LoadError {
    /// Converts any error into a [`LoadError::Storage`].
    ///
    /// The error is not logged here, the coordinator reports every failed fetch.
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        Self::Storage(e.to_string())
    }
}

/// The reason why a caller received a substitute instead of a cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackReason {
    /// The external key is not a valid subject key. No load was attempted.
    #[error("invalid subject key")]
    InvalidKey,
    /// The external key could not be translated to an internal identity. No load was attempted.
    #[error("no internal identity for subject key")]
    TranslationFailed,
    /// The load did not finish within the wait bound.
    ///
    /// The load keeps running in the background and will still populate the cache.
    #[error("load timed out after {0:?}")]
    TimedOut(Duration),
    /// The load finished with an error.
    #[error("load failed: {0}")]
    LoadFailed(#[source] LoadError),
    /// The load succeeded, but the entry was gone again by the time it was read, most likely
    /// because of a concurrent invalidation.
    #[error("entry missing after load")]
    Missing,
}
