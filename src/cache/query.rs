//! Query client: decides per read whether to serve cached data, serve stale
//! data while refreshing, or suspend the caller on a fetch.
//!
//! Fetches are spawned on the current tokio runtime so they complete and
//! commit even when every caller drops its [`Suspension`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::clock::Clock;
use super::entry::{CacheStatus, CachedValue};
use super::error::{FetchError, QueryError};
use super::events::{ChangeKind, StoreEvent};
use super::inflight::{Claim, FetchOutcome, InFlightMap, SharedFetch, Ticket};
use super::keys::{self, CacheKey, KeyPattern};
use super::policy::CachePolicy;
use super::registry::Subscription;
use super::store::CacheStore;

const SOURCE: &str = "cache::query";

pub(crate) const METRIC_HIT_TOTAL: &str = "icebreak_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "icebreak_cache_miss_total";
pub(crate) const METRIC_STALE_SERVED_TOTAL: &str = "icebreak_cache_stale_served_total";
pub(crate) const METRIC_FETCH_TOTAL: &str = "icebreak_cache_fetch_total";
pub(crate) const METRIC_FETCH_ERROR_TOTAL: &str = "icebreak_cache_fetch_error_total";
pub(crate) const METRIC_DEDUP_JOIN_TOTAL: &str = "icebreak_cache_dedup_join_total";
pub(crate) const METRIC_LATE_WRITE_DROPPED_TOTAL: &str = "icebreak_cache_late_write_dropped_total";
pub(crate) const METRIC_FETCH_MS: &str = "icebreak_cache_fetch_ms";

/// Outcome of a single [`QueryClient::query`] call.
pub enum QueryState<T> {
    /// Data is available now (fresh, or stale while a refresh runs).
    Ready(T),
    /// Nothing usable is cached; await the suspension for the fetch result.
    Pending(Suspension<T>),
    /// The cached entry holds a failure from an earlier fetch.
    Failed(QueryError),
}

impl<T> QueryState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending(suspension) => f.debug_tuple("Pending").field(suspension).finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// Pending read. Every clone resolves to the same fetch outcome.
pub struct Suspension<T> {
    key: String,
    fetch: SharedFetch,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Suspension<T> {
    fn new(key: String, fetch: SharedFetch) -> Self {
        Self {
            key,
            fetch,
            _marker: PhantomData,
        }
    }

    /// Canonical key being fetched.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> Clone for Suspension<T> {
    fn clone(&self) -> Self {
        Self::new(self.key.clone(), self.fetch.clone())
    }
}

impl<T> fmt::Debug for Suspension<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T> Future for Suspension<T>
where
    T: Any + Clone,
{
    type Output = Result<T, QueryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.fetch).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(downcast(&this.key, &value)),
            Poll::Ready(Err(error)) => Poll::Ready(Err(QueryError::Fetch(error))),
        }
    }
}

fn downcast<T: Any + Clone>(canonical: &str, value: &CachedValue) -> Result<T, QueryError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| QueryError::type_mismatch::<T>(canonical))
}

/// How a finished fetch writes back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitMode {
    /// Blocking read or background refresh: failures are stored on the entry.
    Query,
    /// Warm-up: failures are logged and dropped.
    Prefetch,
}

impl CommitMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Prefetch => "prefetch",
        }
    }
}

/// Handle to the query engine. Clones share the store and the dedup map.
#[derive(Clone)]
pub struct QueryClient {
    store: CacheStore,
    inflight: Arc<InFlightMap>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_store(CacheStore::new())
    }

    pub fn with_store(store: CacheStore) -> Self {
        Self {
            store,
            inflight: Arc::new(InFlightMap::new()),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_store(CacheStore::with_clock(clock))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Read `key`, fetching with `fetcher` when the cached entry is missing or stale.
    ///
    /// The fetcher is only invoked when this call starts a new fetch; callers
    /// joining an in-flight fetch or served from cache never run it.
    pub fn query<T, F, Fut, E>(&self, key: &CacheKey, fetcher: F, policy: CachePolicy) -> QueryState<T>
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let canonical = keys::serialize(key);
        let entry = self.store.entry_canonical(&canonical);
        let should_fetch = entry
            .as_ref()
            .is_none_or(|entry| self.store.entry_needs_refetch(entry));

        let Some(entry) = entry else {
            return QueryState::Pending(self.suspend(canonical, fetcher, policy));
        };

        if should_fetch && entry.policy.stale_while_revalidate {
            let stale = match downcast::<T>(&canonical, &entry.data) {
                Ok(value) => value,
                Err(error) => return QueryState::Failed(error),
            };
            if !self.inflight.contains(&canonical) {
                self.begin_fetch(&canonical, fetcher, policy, CommitMode::Query);
            }
            counter!(METRIC_STALE_SERVED_TOTAL).increment(1);
            debug!(key = %canonical, result = "stale", "serving stale entry while revalidating");
            return QueryState::Ready(stale);
        }

        if should_fetch {
            return QueryState::Pending(self.suspend(canonical, fetcher, policy));
        }

        if entry.status == CacheStatus::Error {
            let error = entry
                .error
                .clone()
                .unwrap_or_else(|| FetchError::msg("cached entry is marked failed"));
            debug!(key = %canonical, result = "error", "serving cached failure");
            return QueryState::Failed(QueryError::Fetch(error));
        }

        counter!(METRIC_HIT_TOTAL).increment(1);
        debug!(key = %canonical, result = "hit", status = entry.status.as_str(), "cache hit");
        match downcast::<T>(&canonical, &entry.data) {
            Ok(value) => QueryState::Ready(value),
            Err(error) => QueryState::Failed(error),
        }
    }

    /// Read `key` and wait for the value if a fetch is needed.
    ///
    /// The read happens when this is called, not when the future is first
    /// polled; the returned future borrows nothing.
    pub fn fetch_query<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        fetcher: F,
        policy: CachePolicy,
    ) -> impl Future<Output = Result<T, QueryError>> + Send + use<T, F, Fut, E>
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let state = self.query(key, fetcher, policy);
        async move {
            match state {
                QueryState::Ready(value) => Ok(value),
                QueryState::Pending(suspension) => suspension.await,
                QueryState::Failed(error) => Err(error),
            }
        }
    }

    /// Invalidate the selected keys and detach their in-flight fetches.
    ///
    /// A detached fetch still resolves its waiters but no longer writes to the store.
    pub fn invalidate(&self, pattern: impl Into<KeyPattern>) -> usize {
        let pattern = pattern.into();
        let detached = self.inflight.detach_matching(&pattern);
        if detached > 0 {
            debug!(detached, "in-flight fetches detached by invalidation");
        }
        self.store.invalidate(pattern)
    }

    /// Remove every entry and detach every in-flight fetch.
    pub fn clear(&self) {
        self.inflight.detach_all();
        self.store.clear();
    }

    /// Drop entries, listeners and in-flight fetches without notifying anyone.
    pub fn reset(&self) {
        self.inflight.detach_all();
        self.store.reset();
    }

    /// True while a fetch for `key` is outstanding.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inflight.contains(&keys::serialize(key))
    }

    /// Number of outstanding fetches.
    pub fn fetches_in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn subscribe<F>(&self, key: &CacheKey, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(key, listener)
    }

    pub fn subscribe_global<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.store.subscribe_global(listener)
    }

    fn suspend<T, F, Fut, E>(&self, canonical: String, fetcher: F, policy: CachePolicy) -> Suspension<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let fetch = match self.begin_fetch(&canonical, fetcher, policy, CommitMode::Query) {
            FetchStart::Joined(fetch) => {
                counter!(METRIC_DEDUP_JOIN_TOTAL).increment(1);
                debug!(key = %canonical, result = "joined", "joined in-flight fetch");
                fetch
            }
            FetchStart::Started(fetch) => {
                counter!(METRIC_MISS_TOTAL).increment(1);
                debug!(key = %canonical, result = "miss", "cache miss, fetch started");
                fetch
            }
        };
        Suspension::new(canonical, fetch)
    }

    /// Register a fetch for `canonical` unless one is already running.
    ///
    /// A new fetch marks the entry `Fetching` before the fetcher runs and is
    /// driven by a spawned task.
    pub(crate) fn begin_fetch<T, F, Fut, E>(
        &self,
        canonical: &str,
        fetcher: F,
        policy: CachePolicy,
        mode: CommitMode,
    ) -> FetchStart
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let awaited = mode == CommitMode::Query;
        let claim = self.inflight.claim(canonical, awaited, |ticket, opened| {
            let task = FetchTask {
                store: self.store.clone(),
                inflight: Arc::clone(&self.inflight),
                canonical: canonical.to_string(),
                ticket,
                policy,
                mode,
            };
            async move {
                // The claimer opens the gate once its own bookkeeping is done.
                let _ = opened.await;
                task.run(fetcher).await
            }
            .boxed()
        });

        match claim {
            Claim::Joined(fetch) => FetchStart::Joined(fetch),
            Claim::Started { fetch, gate } => {
                if mode == CommitMode::Query {
                    self.store
                        .set_status_canonical(canonical, CacheStatus::Fetching);
                }
                let _ = gate.send(());
                drive(canonical, fetch.clone());
                FetchStart::Started(fetch)
            }
        }
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

pub(crate) enum FetchStart {
    Joined(SharedFetch),
    Started(SharedFetch),
}

impl FetchStart {
    pub(crate) fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    pub(crate) fn into_fetch(self) -> SharedFetch {
        match self {
            Self::Joined(fetch) | Self::Started(fetch) => fetch,
        }
    }
}

/// Everything a fetch needs to commit its result.
struct FetchTask {
    store: CacheStore,
    inflight: Arc<InFlightMap>,
    canonical: String,
    ticket: Ticket,
    policy: CachePolicy,
    mode: CommitMode,
}

impl FetchTask {
    async fn run<T, F, Fut, E>(self, fetcher: F) -> FetchOutcome
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FetchError>,
    {
        counter!(METRIC_FETCH_TOTAL).increment(1);
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(async move { fetcher().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(Arc::new(value) as CachedValue),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(FetchError::msg(format!(
                "fetcher for `{}` panicked",
                self.canonical
            ))),
        };
        histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        self.commit(&outcome);
        self.inflight.release(&self.canonical, self.ticket);
        outcome
    }

    fn commit(&self, outcome: &FetchOutcome) {
        if let Err(error) = outcome {
            counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
            if self.mode == CommitMode::Prefetch {
                warn!(
                    target_module = SOURCE,
                    key = %self.canonical,
                    op = self.mode.as_str(),
                    error = %error,
                    "prefetch failed"
                );
            }
        }

        // Written under the dedup slot so a concurrent detach cannot slip
        // between the ticket check and the store write.
        let written = self.inflight.with_current(&self.canonical, self.ticket, |awaited| {
            match outcome {
                Ok(value) => {
                    self.store.write_value(
                        &self.canonical,
                        Arc::clone(value),
                        self.policy,
                        CacheStatus::Fresh,
                    );
                    Some(ChangeKind::Set)
                }
                Err(error) if self.mode == CommitMode::Query || awaited => self
                    .store
                    .write_error(&self.canonical, error.clone())
                    .then_some(ChangeKind::Error),
                Err(_) => None,
            }
        });

        match written {
            None => {
                counter!(METRIC_LATE_WRITE_DROPPED_TOTAL).increment(1);
                debug!(
                    key = %self.canonical,
                    op = self.mode.as_str(),
                    "fetch was detached, result not committed"
                );
            }
            Some(Some(kind)) => {
                self.store.notify(&self.canonical, kind);
                debug!(
                    key = %self.canonical,
                    op = self.mode.as_str(),
                    result = kind.as_str(),
                    "fetch committed"
                );
            }
            Some(None) => {}
        }
    }
}

/// Poll the fetch to completion on the ambient runtime.
///
/// Without a runtime the fetch only progresses while a caller awaits it.
fn drive(canonical: &str, fetch: SharedFetch) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = fetch.await;
            });
        }
        Err(_) => {
            warn!(
                target_module = SOURCE,
                key = %canonical,
                "no tokio runtime, fetch runs only while awaited"
            );
        }
    }
}
