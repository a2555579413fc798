//! Error types surfaced by the query engine.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure produced by a fetcher or mutation function.
///
/// Cloning is cheap and preserves identity: the error stored on a cache entry
/// and the error returned to every waiting caller are the same allocation.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl FetchError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Returns true if both handles point at the same underlying failure.
    pub fn same_as(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attempt to view the underlying error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.inner).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

/// Failure returned by a query read.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("cached value for `{key}` is not a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },
}

impl QueryError {
    pub(crate) fn type_mismatch<T>(key: impl Into<String>) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected: std::any::type_name::<T>(),
        }
    }

    /// The fetch failure behind this error, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(error) => Some(error),
            Self::TypeMismatch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream unavailable")]
    struct Upstream;

    #[test]
    fn clones_share_identity() {
        let error = FetchError::new(Upstream);
        let copy = error.clone();
        assert!(error.same_as(&copy));
        assert!(!error.same_as(&FetchError::new(Upstream)));
        assert_eq!(copy.to_string(), "upstream unavailable");
    }

    #[test]
    fn downcast_recovers_concrete_error() {
        let error = FetchError::new(Upstream);
        assert!(error.downcast_ref::<Upstream>().is_some());
        assert!(error.downcast_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn query_error_exposes_fetch_error() {
        let error = FetchError::msg("boom");
        let query = QueryError::from(error.clone());
        assert!(query.fetch_error().is_some_and(|inner| inner.same_as(&error)));
        assert_eq!(query.to_string(), "fetch failed: boom");

        let mismatch = QueryError::type_mismatch::<u32>("profile");
        assert!(mismatch.fetch_error().is_none());
        assert_eq!(mismatch.to_string(), "cached value for `profile` is not a `u32`");
    }
}
