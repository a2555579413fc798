//! Listener registry.
//!
//! Tracks per-key listeners and global listeners. Registration hands back a
//! [`Subscription`] which removes the listener when dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use super::events::StoreEvent;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Callback invoked after a store mutation.
pub type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

type ListenerId = u64;

/// Maps canonical keys to their listeners, plus the global listener set.
///
/// Listener maps are ordered by registration so notification order is stable.
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    by_key: RwLock<HashMap<String, BTreeMap<ListenerId, Listener>>>,
    global: RwLock<BTreeMap<ListenerId, Listener>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_key: RwLock::new(HashMap::new()),
            global: RwLock::new(BTreeMap::new()),
        }
    }

    fn allocate_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_key(self: &Arc<Self>, key: String, listener: Listener) -> Subscription {
        let id = self.allocate_id();
        rw_write(&self.by_key, SOURCE, "register_key")
            .entry(key.clone())
            .or_default()
            .insert(id, listener);
        Subscription::new(Arc::downgrade(self), Target::Key(key), id)
    }

    pub(crate) fn register_global(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.allocate_id();
        rw_write(&self.global, SOURCE, "register_global").insert(id, listener);
        Subscription::new(Arc::downgrade(self), Target::Global, id)
    }

    fn unregister(&self, target: &Target, id: ListenerId) {
        match target {
            Target::Key(key) => {
                let mut by_key = rw_write(&self.by_key, SOURCE, "unregister_key");
                if let Some(listeners) = by_key.get_mut(key) {
                    listeners.remove(&id);
                    if listeners.is_empty() {
                        by_key.remove(key);
                    }
                }
            }
            Target::Global => {
                rw_write(&self.global, SOURCE, "unregister_global").remove(&id);
            }
        }
    }

    /// Snapshot of the listeners for one key.
    pub(crate) fn key_listeners(&self, key: &str) -> Vec<Listener> {
        rw_read(&self.by_key, SOURCE, "key_listeners")
            .get(key)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every key's listeners.
    pub(crate) fn all_key_listeners(&self) -> Vec<(String, Vec<Listener>)> {
        rw_read(&self.by_key, SOURCE, "all_key_listeners")
            .iter()
            .map(|(key, listeners)| (key.clone(), listeners.values().cloned().collect()))
            .collect()
    }

    pub(crate) fn global_listeners(&self) -> Vec<Listener> {
        rw_read(&self.global, SOURCE, "global_listeners")
            .values()
            .cloned()
            .collect()
    }

    /// Drop every listener.
    pub(crate) fn clear(&self) {
        rw_write(&self.by_key, SOURCE, "clear.by_key").clear();
        rw_write(&self.global, SOURCE, "clear.global").clear();
    }

    /// Number of keys with at least one listener.
    pub(crate) fn key_count(&self) -> usize {
        rw_read(&self.by_key, SOURCE, "key_count").len()
    }

    pub(crate) fn global_count(&self) -> usize {
        rw_read(&self.global, SOURCE, "global_count").len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Key(String),
    Global,
}

/// Handle to a registered listener.
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) removes the
/// listener. Use [`Subscription::detach`] to keep it registered for the
/// lifetime of the store.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    target: Target,
    id: ListenerId,
    active: bool,
}

impl Subscription {
    fn new(registry: Weak<ListenerRegistry>, target: Target, id: ListenerId) -> Self {
        Self {
            registry,
            target,
            id,
            active: true,
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the listener registered without holding the handle.
    pub fn detach(mut self) {
        self.active = false;
    }

    /// The canonical key observed, or `None` for a global subscription.
    pub fn key(&self) -> Option<&str> {
        match &self.target {
            Target::Key(key) => Some(key),
            Target::Global => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.target, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::events::ChangeKind;

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: &StoreEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn fire(listeners: Vec<Listener>) {
        let event = StoreEvent::new(1, Some("k".to_string()), ChangeKind::Set);
        for listener in listeners {
            listener(&event);
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let _sub = registry.register_key("k".to_string(), counting(&hits));
        assert_eq!(registry.key_count(), 1);

        fire(registry.key_listeners("k"));
        fire(registry.key_listeners("other"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_cleans_up_mappings() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let key_sub = registry.register_key("k".to_string(), counting(&hits));
        let global_sub = registry.register_global(counting(&hits));
        assert_eq!(key_sub.key(), Some("k"));
        assert_eq!(global_sub.key(), None);

        key_sub.unsubscribe();
        drop(global_sub);

        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.global_count(), 0);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register_global(counting(&hits)).detach();
        assert_eq!(registry.global_count(), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = registry.register_key("k".to_string(), counting(&hits));
        drop(registry);
        drop(sub);
    }

    #[test]
    fn clear_removes_all_listeners() {
        let registry = Arc::new(ListenerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let _a = registry.register_key("a".to_string(), counting(&hits));
        let _b = registry.register_key("b".to_string(), counting(&hits));
        let _g = registry.register_global(counting(&hits));
        assert_eq!(registry.all_key_listeners().len(), 2);

        registry.clear();
        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.global_count(), 0);
    }
}
