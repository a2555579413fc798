//! Async adapters over store subscriptions.
//!
//! A UI layer re-renders when the store tells it something changed. These
//! types turn listener callbacks into `tokio::sync::watch` receivers that can
//! be awaited.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;

use tokio::sync::watch;

use super::error::{FetchError, QueryError};
use super::events::StoreEvent;
use super::keys::CacheKey;
use super::policy::CachePolicy;
use super::query::{QueryClient, QueryState};
use super::registry::Subscription;

/// Notification stream for one key.
#[derive(Debug)]
pub struct KeyWatch {
    key: CacheKey,
    events: watch::Receiver<Option<StoreEvent>>,
    _subscription: Subscription,
}

impl KeyWatch {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the next notification. Returns `false` once the listener was
    /// removed (the store was reset).
    pub async fn changed(&mut self) -> bool {
        self.events.changed().await.is_ok()
    }

    /// Most recent event seen for this key.
    pub fn last_event(&self) -> Option<StoreEvent> {
        self.events.borrow().clone()
    }

    /// Treat everything delivered so far as seen.
    pub fn mark_seen(&mut self) {
        self.events.mark_unchanged();
    }
}

/// Notification stream for the whole store.
#[derive(Debug)]
pub struct StoreWatch {
    events: watch::Receiver<Option<StoreEvent>>,
    _subscription: Subscription,
}

impl StoreWatch {
    pub async fn changed(&mut self) -> bool {
        self.events.changed().await.is_ok()
    }

    pub fn last_event(&self) -> Option<StoreEvent> {
        self.events.borrow().clone()
    }
}

/// A query bound to its key, fetcher and policy, re-run whenever the key changes.
pub struct QueryWatch<T, F> {
    client: QueryClient,
    fetcher: F,
    policy: CachePolicy,
    watch: KeyWatch,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F, Fut, E> QueryWatch<T, F>
where
    T: Any + Clone + Send + Sync,
    F: Fn() -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + 'static,
{
    pub fn key(&self) -> &CacheKey {
        self.watch.key()
    }

    /// Run the query once, as a render would.
    pub fn current(&self) -> QueryState<T> {
        self.client
            .query(self.watch.key(), self.fetcher.clone(), self.policy)
    }

    /// Run the query and wait for a value if it suspends.
    pub async fn resolve(&mut self) -> Result<T, QueryError> {
        let result = self
            .client
            .fetch_query(self.watch.key(), self.fetcher.clone(), self.policy)
            .await;
        // Writes caused by this read are not news to the caller.
        self.watch.mark_seen();
        result
    }

    /// Wait for the key to change, then resolve it again.
    ///
    /// Returns `None` once the store dropped its listeners.
    pub async fn next(&mut self) -> Option<Result<T, QueryError>> {
        if !self.watch.changed().await {
            return None;
        }
        Some(self.resolve().await)
    }
}

impl QueryClient {
    /// Watch notifications for `key`.
    pub fn watch_key(&self, key: &CacheKey) -> KeyWatch {
        let (sender, events) = watch::channel(None);
        let subscription = self.subscribe(key, move |event: &StoreEvent| {
            sender.send_replace(Some(event.clone()));
        });
        KeyWatch {
            key: key.clone(),
            events,
            _subscription: subscription,
        }
    }

    /// Watch every store notification.
    pub fn watch_store(&self) -> StoreWatch {
        let (sender, events) = watch::channel(None);
        let subscription = self.subscribe_global(move |event: &StoreEvent| {
            sender.send_replace(Some(event.clone()));
        });
        StoreWatch {
            events,
            _subscription: subscription,
        }
    }

    /// Bind a query to its key so it can be re-run on every change.
    pub fn watch_query<T, F, Fut, E>(&self, key: &CacheKey, fetcher: F, policy: CachePolicy) -> QueryWatch<T, F>
    where
        T: Any + Clone + Send + Sync,
        F: Fn() -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        QueryWatch {
            client: self.clone(),
            fetcher,
            policy,
            watch: self.watch_key(key),
            _marker: PhantomData,
        }
    }
}
