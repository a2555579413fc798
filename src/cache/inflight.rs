//! In-flight fetch tracking.
//!
//! At most one fetch per canonical key is outstanding at any time. Each fetch
//! holds a ticket; a fetch whose ticket was detached (the key was invalidated
//! or the cache cleared while it ran) must not commit its result.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use super::entry::CachedValue;
use super::error::FetchError;
use super::keys::{self, KeyPattern};

/// Result of one fetch, shared by every waiter.
pub(crate) type FetchOutcome = Result<CachedValue, FetchError>;

/// A fetch that any number of callers can await.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Identity of one fetch attempt.
pub(crate) type Ticket = u64;

/// Held by the caller that started a fetch; the fetch body waits on it before
/// calling the fetcher so the caller can finish bookkeeping first.
pub(crate) type StartGate = oneshot::Sender<()>;

struct Slot {
    ticket: Ticket,
    fetch: SharedFetch,
    /// A blocking read is waiting on this fetch.
    awaited: bool,
}

pub(crate) enum Claim {
    /// Another caller's fetch is already running for this key.
    Joined(SharedFetch),
    /// This caller registered a new fetch and must open the gate.
    Started { fetch: SharedFetch, gate: StartGate },
}

/// Dedup map keyed by canonical key.
#[derive(Default)]
pub(crate) struct InFlightMap {
    slots: DashMap<String, Slot>,
    tickets: AtomicU64,
}

impl InFlightMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the running fetch for `canonical`, or register a new one built by `make`.
    ///
    /// `awaited` records that the caller blocks on the outcome, which makes a
    /// failure of the fetch worth storing even if it was started as a prefetch.
    /// `make` runs under the map's shard lock: it must only assemble the
    /// future, never poll it or call into the cache.
    pub(crate) fn claim<M>(&self, canonical: &str, awaited: bool, make: M) -> Claim
    where
        M: FnOnce(Ticket, oneshot::Receiver<()>) -> BoxFuture<'static, FetchOutcome>,
    {
        match self.slots.entry(canonical.to_string()) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                slot.awaited |= awaited;
                Claim::Joined(slot.fetch.clone())
            }
            Entry::Vacant(vacant) => {
                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
                let (gate, opened) = oneshot::channel();
                let fetch = make(ticket, opened).shared();
                vacant.insert(Slot {
                    ticket,
                    fetch: fetch.clone(),
                    awaited,
                });
                Claim::Started { fetch, gate }
            }
        }
    }

    pub(crate) fn contains(&self, canonical: &str) -> bool {
        self.slots.contains_key(canonical)
    }

    /// Run `commit` only while `ticket` still owns the slot for `canonical`.
    ///
    /// The slot's shard stays read-locked for the duration, so a concurrent
    /// detach waits until `commit` returns. `commit` receives the slot's
    /// `awaited` flag and must not call back into this map.
    pub(crate) fn with_current<R>(
        &self,
        canonical: &str,
        ticket: Ticket,
        commit: impl FnOnce(bool) -> R,
    ) -> Option<R> {
        let slot = self.slots.get(canonical)?;
        (slot.ticket == ticket).then(|| commit(slot.awaited))
    }

    /// Free the slot if `ticket` still owns it.
    pub(crate) fn release(&self, canonical: &str, ticket: Ticket) -> bool {
        self.slots
            .remove_if(canonical, |_, slot| slot.ticket == ticket)
            .is_some()
    }

    /// Detach every fetch whose key matches `pattern`. Returns how many were detached.
    pub(crate) fn detach_matching(&self, pattern: &KeyPattern) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|canonical, _| !keys::matches(canonical, pattern));
        before.saturating_sub(self.slots.len())
    }

    pub(crate) fn detach_all(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
