//! Cache entries and their status machine.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::clock::EpochMillis;
use super::error::FetchError;
use super::policy::CachePolicy;

/// Type-erased cached value.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Per-entry state. Staleness is not a status: it is derived from the policy
/// and timestamp at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStatus {
    #[default]
    Fresh,
    Fetching,
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Fetching => "fetching",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored value plus its metadata.
#[derive(Clone)]
pub struct CacheEntry {
    pub(crate) data: CachedValue,
    pub timestamp: EpochMillis,
    pub policy: CachePolicy,
    pub status: CacheStatus,
    pub error: Option<FetchError>,
}

impl CacheEntry {
    pub(crate) fn new(
        data: CachedValue,
        timestamp: EpochMillis,
        policy: CachePolicy,
        status: CacheStatus,
    ) -> Self {
        Self {
            data,
            timestamp,
            policy,
            status,
            error: None,
        }
    }

    /// Typed view of the stored data.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// True once `now` is past the policy's TTL. Entries without a TTL never go stale.
    pub fn is_expired(&self, now: EpochMillis) -> bool {
        match self.policy.ttl_ms() {
            None => false,
            Some(0) => true,
            Some(ttl) => now.saturating_sub(self.timestamp) > ttl,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("timestamp", &self.timestamp)
            .field("policy", &self.policy)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
