//! Listener registry shared by everything observable in the crate.
//!
//! Caches, managers and observers all broadcast events to a set of
//! callbacks. `ListenerSet` keeps them behind monotonically increasing ids
//! so a listener can be removed without affecting the others, and snapshots
//! the set before emitting so a callback may subscribe or unsubscribe
//! re-entrantly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) struct ListenerSet<E> {
    listeners: Mutex<BTreeMap<u64, Listener<E>>>,
    next_id: AtomicU64,
}

impl<E> ListenerSet<E> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener and returns the id used to remove it.
    pub(crate) fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    /// Removes a listener. Returns `true` if it was registered.
    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Invokes every listener in registration order.
    pub(crate) fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let set = ListenerSet::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen1 = seen.clone();
        let seen2 = seen.clone();
        set.subscribe(move |value| {
            seen1.fetch_add(*value as usize, Ordering::Relaxed);
        });
        set.subscribe(move |value| {
            seen2.fetch_add(*value as usize * 10, Ordering::Relaxed);
        });

        set.emit(&2);
        assert_eq!(seen.load(Ordering::Relaxed), 22);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let set = ListenerSet::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = set.subscribe(move |()| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        assert!(set.unsubscribe(id));
        assert!(!set.unsubscribe(id));
        set.emit(&());
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let set = ListenerSet::<()>::new();
        let a = set.subscribe(|()| {});
        let b = set.subscribe(|()| {});
        assert_ne!(a, b);
    }

    #[test]
    fn test_emit_order_is_registration_order() {
        let set = ListenerSet::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            set.subscribe(move |()| order.lock().push(tag));
        }

        set.emit(&());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }
}
