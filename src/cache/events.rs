//! Store change notifications.
//!
//! Every store mutation produces one [`StoreEvent`] which is handed to the
//! key's listeners and then to the global listeners.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic sequence number of a store mutation.
pub type Epoch = u64;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// An entry was written by `set`.
    Set,
    /// An existing entry was marked failed.
    Error,
    /// An existing entry changed status without new data.
    Status,
    /// The key was invalidated (whether or not an entry existed).
    Invalidated,
    /// The whole store was cleared.
    Cleared,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Error => "error",
            Self::Status => "status",
            Self::Invalidated => "invalidated",
            Self::Cleared => "cleared",
        }
    }
}

/// Notification delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Monotonic epoch for ordering within this store.
    pub epoch: Epoch,
    /// Canonical key affected, `None` for a store-wide clear delivered to global listeners.
    pub key: Option<String>,
    pub kind: ChangeKind,
}

impl StoreEvent {
    pub fn new(epoch: Epoch, key: Option<String>, kind: ChangeKind) -> Self {
        Self { epoch, key, kind }
    }
}

/// Epoch source shared by a store's mutations.
#[derive(Debug, Default)]
pub(crate) struct EpochCounter {
    counter: AtomicU64,
}

impl EpochCounter {
    pub(crate) fn next(&self) -> Epoch {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn current(&self) -> Epoch {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_monotonicity() {
        let epochs = EpochCounter::default();
        assert_eq!(epochs.current(), 0);

        let e1 = epochs.next();
        let e2 = epochs.next();
        let e3 = epochs.next();

        assert!(e1 < e2);
        assert!(e2 < e3);
        assert_eq!(epochs.current(), e3);
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(ChangeKind::Invalidated.as_str(), "invalidated");
        let event = StoreEvent::new(4, Some("k".to_string()), ChangeKind::Set);
        assert_eq!(event.key.as_deref(), Some("k"));
        assert_eq!(event.kind.as_str(), "set");
    }
}
