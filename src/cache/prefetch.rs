//! Cache warming ahead of reads.

use std::any::Any;
use std::future::Future;

use futures::future::join_all;
use tracing::debug;

use super::error::FetchError;
use super::keys::{self, CacheKey};
use super::policy::CachePolicy;
use super::query::{CommitMode, QueryClient};

impl QueryClient {
    /// Fetch `key` into the cache unless it is fresh or already being fetched.
    ///
    /// Failures are logged, never returned. The fetch runs on a spawned task,
    /// so dropping the returned future does not cancel it. Resolves to `true`
    /// when this call started a fetch.
    pub async fn prefetch<T, F, Fut, E>(&self, key: &CacheKey, fetcher: F, policy: CachePolicy) -> bool
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let canonical = keys::serialize(key);
        if !self.store().should_refetch_canonical(&canonical) {
            debug!(key = %canonical, op = "prefetch", result = "skipped", "entry does not need a fetch");
            return false;
        }

        let start = self.begin_fetch(&canonical, fetcher, policy, CommitMode::Prefetch);
        if !start.is_started() {
            debug!(key = %canonical, op = "prefetch", result = "joined", "fetch already in flight");
            return false;
        }
        // Outcome already committed or logged by the fetch itself.
        let _ = start.into_fetch().await;
        true
    }

    /// Prefetch several keys concurrently with one policy.
    ///
    /// Resolves to the number of fetches actually started.
    pub async fn prefetch_many<T, F, Fut, E, I>(&self, requests: I, policy: CachePolicy) -> usize
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
        I: IntoIterator<Item = (CacheKey, F)>,
    {
        let warmups = requests.into_iter().map(|(key, fetcher)| async move {
            self.prefetch(&key, fetcher, policy).await
        });
        join_all(warmups)
            .await
            .into_iter()
            .filter(|started| *started)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future;

    use super::*;
    use crate::cache::query::QueryState;
    use crate::cache_key;

    fn ttl(ms: u64) -> CachePolicy {
        CachePolicy::with_ttl(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn prefetch_fills_cache_for_later_reads() {
        let client = QueryClient::new();
        let key = cache_key!["quiz", 4];

        let started = client
            .prefetch(&key, || future::ready(Ok::<_, FetchError>(String::from("q4"))), ttl(60_000))
            .await;
        assert!(started);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let state = client.query(
            &key,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
                future::ready(Ok::<_, FetchError>(String::from("unused")))
            },
            ttl(60_000),
        );
        assert_eq!(state.ready().map(String::as_str), Some("q4"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prefetch_skips_fresh_entries() {
        let client = QueryClient::new();
        let key = cache_key!["quiz", 4];
        client.store().set(&key, 1u8, ttl(60_000));

        let started = client
            .prefetch(&key, || future::ready(Ok::<_, FetchError>(2u8)), ttl(60_000))
            .await;
        assert!(!started);
        assert_eq!(client.store().get::<u8>(&key), Some(1));
    }

    #[tokio::test]
    async fn prefetch_failure_is_swallowed_and_not_stored() {
        let client = QueryClient::new();
        let key = cache_key!["quiz", 5];
        client.store().set(&key, 1u8, ttl(0));

        let started = client
            .prefetch(&key, || future::ready(Err::<u8, _>("offline")), ttl(0))
            .await;
        assert!(started);

        let entry = client.store().entry(&key).expect("entry kept");
        assert!(entry.error.is_none());
        assert_eq!(entry.data::<u8>(), Some(&1));
        assert!(!client.is_fetching(&key));
    }

    #[tokio::test]
    async fn prefetch_many_counts_started_fetches() {
        let client = QueryClient::new();
        client.store().set(&cache_key!["a"], 0u32, ttl(60_000));

        let requests = ["a", "b", "c"].map(|name| {
            (cache_key![name], move || {
                future::ready(Ok::<_, FetchError>(name.len() as u32))
            })
        });
        let started = client.prefetch_many(requests, ttl(60_000)).await;
        assert_eq!(started, 2);
        assert_eq!(client.store().get::<u32>(&cache_key!["b"]), Some(1));
        assert!(matches!(
            client.query(&cache_key!["c"], || future::ready(Ok::<u32, FetchError>(9)), ttl(60_000)),
            QueryState::Ready(1)
        ));
    }
}
