//! Cache store: the single source of truth for cached query data.
//!
//! Maps canonical keys to [`CacheEntry`] values and notifies listeners after
//! every mutation. The store never performs I/O; fetching is the query
//! client's job.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use metrics::counter;
use tracing::{debug, trace};

use super::clock::{Clock, EpochMillis, SystemClock};
use super::entry::{CacheEntry, CacheStatus, CachedValue};
use super::error::FetchError;
use super::events::{ChangeKind, EpochCounter, StoreEvent};
use super::keys::{self, CacheKey, KeyPattern};
use super::lock::{rw_read, rw_write};
use super::policy::CachePolicy;
use super::registry::{Listener, ListenerRegistry, Subscription};

const SOURCE: &str = "cache::store";
const METRIC_INVALIDATED_TOTAL: &str = "icebreak_cache_invalidated_total";

struct StoreInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    listeners: Arc<ListenerRegistry>,
    epochs: EpochCounter,
    clock: Arc<dyn Clock>,
}

/// Shared handle to a cache store. Clones observe the same entries.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    /// Create an empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(HashMap::new()),
                listeners: Arc::new(ListenerRegistry::new()),
                epochs: EpochCounter::default(),
                clock,
            }),
        }
    }

    pub fn now_ms(&self) -> EpochMillis {
        self.inner.clock.now_ms()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached data for `key`, without any staleness check.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    pub fn get<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Any + Clone,
    {
        let canonical = keys::serialize(key);
        rw_read(&self.inner.entries, SOURCE, "get")
            .get(&canonical)
            .and_then(|entry| entry.data::<T>().cloned())
    }

    /// Full entry for `key`, including status, timestamp and error.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entry_canonical(&keys::serialize(key))
    }

    pub(crate) fn entry_canonical(&self, canonical: &str) -> Option<CacheEntry> {
        rw_read(&self.inner.entries, SOURCE, "entry")
            .get(canonical)
            .cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        rw_read(&self.inner.entries, SOURCE, "contains").contains_key(&keys::serialize(key))
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut stored: Vec<String> = rw_read(&self.inner.entries, SOURCE, "keys")
            .keys()
            .cloned()
            .collect();
        stored.sort();
        stored
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store `data` as a fresh entry, replacing any previous value, timestamp and policy.
    pub fn set<T>(&self, key: &CacheKey, data: T, policy: CachePolicy)
    where
        T: Any + Send + Sync,
    {
        self.set_with_status(key, data, policy, CacheStatus::Fresh);
    }

    pub fn set_with_status<T>(&self, key: &CacheKey, data: T, policy: CachePolicy, status: CacheStatus)
    where
        T: Any + Send + Sync,
    {
        self.set_value(&keys::serialize(key), Arc::new(data), policy, status);
    }

    pub(crate) fn set_value(
        &self,
        canonical: &str,
        data: CachedValue,
        policy: CachePolicy,
        status: CacheStatus,
    ) {
        self.write_value(canonical, data, policy, status);
        self.notify(canonical, ChangeKind::Set);
    }

    /// Insert without notifying. The caller owes a `ChangeKind::Set` notification.
    pub(crate) fn write_value(
        &self,
        canonical: &str,
        data: CachedValue,
        policy: CachePolicy,
        status: CacheStatus,
    ) {
        let entry = CacheEntry::new(data, self.now_ms(), policy, status);
        rw_write(&self.inner.entries, SOURCE, "set").insert(canonical.to_string(), entry);
        trace!(key = canonical, status = status.as_str(), "cache entry set");
    }

    /// Mark an existing entry as failed.
    ///
    /// A failure before any successful write is not persisted: without an
    /// entry this is a no-op and nobody is notified.
    pub fn set_error(&self, key: &CacheKey, error: FetchError) {
        self.set_error_canonical(&keys::serialize(key), error);
    }

    pub(crate) fn set_error_canonical(&self, canonical: &str, error: FetchError) {
        if self.write_error(canonical, error) {
            self.notify(canonical, ChangeKind::Error);
        }
    }

    /// Mark an existing entry failed without notifying. Returns false when absent.
    pub(crate) fn write_error(&self, canonical: &str, error: FetchError) -> bool {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "set_error");
        match entries.get_mut(canonical) {
            Some(entry) => {
                entry.status = CacheStatus::Error;
                entry.error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Change an existing entry's status without touching its data.
    pub fn set_status(&self, key: &CacheKey, status: CacheStatus) {
        self.set_status_canonical(&keys::serialize(key), status);
    }

    pub(crate) fn set_status_canonical(&self, canonical: &str, status: CacheStatus) {
        let updated = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "set_status");
            match entries.get_mut(canonical) {
                Some(entry) => {
                    entry.status = status;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(canonical, ChangeKind::Status);
        }
    }

    // ========================================================================
    // Staleness
    // ========================================================================

    /// Whether a read of `key` should go to the fetcher.
    pub fn should_refetch(&self, key: &CacheKey) -> bool {
        self.should_refetch_canonical(&keys::serialize(key))
    }

    pub(crate) fn should_refetch_canonical(&self, canonical: &str) -> bool {
        let entries = rw_read(&self.inner.entries, SOURCE, "should_refetch");
        match entries.get(canonical) {
            None => true,
            Some(entry) => self.entry_needs_refetch(entry),
        }
    }

    /// A failed entry is only retried automatically under stale-while-revalidate;
    /// otherwise the error stands until the key is written or invalidated.
    pub(crate) fn entry_needs_refetch(&self, entry: &CacheEntry) -> bool {
        match entry.status {
            CacheStatus::Fetching => false,
            CacheStatus::Error if !entry.policy.stale_while_revalidate => false,
            _ if entry.policy.on_demand_only => false,
            _ => entry.is_expired(self.now_ms()),
        }
    }

    /// Whether `key` holds stale data that may be served while it is refreshed.
    pub fn should_stale_while_revalidate(&self, key: &CacheKey) -> bool {
        self.should_stale_while_revalidate_canonical(&keys::serialize(key))
    }

    pub(crate) fn should_stale_while_revalidate_canonical(&self, canonical: &str) -> bool {
        let entries = rw_read(&self.inner.entries, SOURCE, "should_stale_while_revalidate");
        entries.get(canonical).is_some_and(|entry| {
            entry.policy.stale_while_revalidate && self.entry_needs_refetch(entry)
        })
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove the entries selected by `pattern` and notify their listeners.
    ///
    /// A key pattern always notifies that key, even when nothing was stored.
    /// A predicate pattern is evaluated against every stored key. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, pattern: impl Into<KeyPattern>) -> usize {
        let pattern = pattern.into();
        match &pattern {
            KeyPattern::Key(key) => {
                let canonical = keys::serialize(key);
                let removed = rw_write(&self.inner.entries, SOURCE, "invalidate.key")
                    .remove(&canonical)
                    .is_some();
                debug!(key = %canonical, removed, "cache key invalidated");
                self.notify(&canonical, ChangeKind::Invalidated);
                let removed = usize::from(removed);
                counter!(METRIC_INVALIDATED_TOTAL).increment(removed as u64);
                removed
            }
            KeyPattern::Predicate(_) => {
                let removed: Vec<String> = {
                    let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate.predicate");
                    let matched: Vec<String> = entries
                        .keys()
                        .filter(|stored| keys::matches(stored, &pattern))
                        .cloned()
                        .collect();
                    for stored in &matched {
                        entries.remove(stored);
                    }
                    matched
                };
                debug!(count = removed.len(), "cache keys invalidated by predicate");
                for canonical in &removed {
                    self.notify(canonical, ChangeKind::Invalidated);
                }
                counter!(METRIC_INVALIDATED_TOTAL).increment(removed.len() as u64);
                removed.len()
            }
        }
    }

    /// Remove every entry. Each key listener and each global listener is notified once.
    pub fn clear(&self) {
        let removed = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "clear");
            let count = entries.len();
            entries.clear();
            count
        };
        debug!(removed, "cache cleared");
        counter!(METRIC_INVALIDATED_TOTAL).increment(removed as u64);

        let epoch = self.inner.epochs.next();
        for (key, listeners) in self.inner.listeners.all_key_listeners() {
            let event = StoreEvent::new(epoch, Some(key), ChangeKind::Cleared);
            for listener in listeners {
                listener(&event);
            }
        }
        let event = StoreEvent::new(epoch, None, ChangeKind::Cleared);
        for listener in self.inner.listeners.global_listeners() {
            listener(&event);
        }
    }

    /// Drop every entry and every listener without notifying anyone.
    ///
    /// Intended for test isolation between cases sharing one store.
    pub fn reset(&self) {
        rw_write(&self.inner.entries, SOURCE, "reset").clear();
        self.inner.listeners.clear();
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Listen for mutations of one key.
    pub fn subscribe<F>(&self, key: &CacheKey, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.subscribe_canonical(keys::serialize(key), Arc::new(listener))
    }

    pub(crate) fn subscribe_canonical(&self, canonical: String, listener: Listener) -> Subscription {
        self.inner.listeners.register_key(canonical, listener)
    }

    /// Listen for every mutation of the store.
    pub fn subscribe_global<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.register_global(Arc::new(listener))
    }

    /// Number of keys with at least one listener.
    pub fn subscribed_key_count(&self) -> usize {
        self.inner.listeners.key_count()
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.inner.listeners.global_count()
    }

    /// Key listeners first, then global listeners. Called with no lock held.
    pub(crate) fn notify(&self, canonical: &str, kind: ChangeKind) {
        let event = StoreEvent::new(self.inner.epochs.next(), Some(canonical.to_string()), kind);
        for listener in self.inner.listeners.key_listeners(canonical) {
            listener(&event);
        }
        for listener in self.inner.listeners.global_listeners() {
            listener(&event);
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("epoch", &self.inner.epochs.current())
            .finish_non_exhaustive()
    }
}
