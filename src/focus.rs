//! Ambient "focused" signal.
//!
//! The engine itself has no notion of a window; an embedding plugs in an
//! event source with [`FocusManager::set_event_listener`] and the manager
//! broadcasts transitions to its subscribers. Until told otherwise the
//! process is considered focused.
//!
//! A process-wide instance is available through [`focus_manager`]; tests and
//! embeddings that need isolation construct their own and hand it to the
//! client.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::listeners::ListenerSet;

/// Tears down a previously installed event source.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Handle given to an event source for feeding focus changes back in.
#[derive(Clone)]
pub struct FocusSetter {
    manager: Weak<FocusManager>,
}

impl FocusSetter {
    pub fn set(&self, focused: bool) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_focused(Some(focused));
        }
    }
}

pub struct FocusManager {
    focused: Mutex<Option<bool>>,
    listeners: ListenerSet<bool>,
    teardown: Mutex<Option<Teardown>>,
}

impl FocusManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            focused: Mutex::new(None),
            listeners: ListenerSet::new(),
            teardown: Mutex::new(None),
        })
    }

    /// Installs the environment-specific event source, replacing (and
    /// tearing down) any previous one.
    pub fn set_event_listener<F>(self: &Arc<Self>, setup: F)
    where
        F: FnOnce(FocusSetter) -> Teardown,
    {
        let setter = FocusSetter {
            manager: Arc::downgrade(self),
        };
        let teardown = setup(setter);
        let previous = self.teardown.lock().replace(teardown);
        if let Some(previous) = previous {
            previous();
        }
    }

    /// Overrides the focused state. `None` restores the default (focused).
    /// Listeners are notified only when the effective value changes.
    pub fn set_focused(&self, focused: Option<bool>) {
        let changed = {
            let mut current = self.focused.lock();
            let before = current.unwrap_or(true);
            *current = focused;
            before != current.unwrap_or(true)
        };
        if changed {
            self.listeners.emit(&self.is_focused());
        }
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.focused.lock().unwrap_or(true)
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        self.listeners.subscribe(move |focused| listener(*focused))
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.unsubscribe(id)
    }
}

/// The process-wide focus manager.
#[must_use]
pub fn focus_manager() -> Arc<FocusManager> {
    static GLOBAL: OnceLock<Arc<FocusManager>> = OnceLock::new();
    GLOBAL.get_or_init(FocusManager::new).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_focused_by_default() {
        let manager = FocusManager::new();
        assert!(manager.is_focused());
    }

    #[test]
    fn test_broadcasts_on_transition_only() {
        let manager = FocusManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        manager.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        manager.set_focused(Some(true)); // no transition: default is focused
        assert_eq!(count.load(Ordering::Relaxed), 0);

        manager.set_focused(Some(false));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        manager.set_focused(Some(false));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        manager.set_focused(None); // back to the focused default
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_listener_feeds_manager() {
        let manager = FocusManager::new();
        let setter_slot: Arc<Mutex<Option<FocusSetter>>> = Arc::new(Mutex::new(None));

        let slot = setter_slot.clone();
        manager.set_event_listener(move |setter| {
            *slot.lock() = Some(setter);
            Box::new(|| {})
        });

        let setter = setter_slot.lock().clone().expect("setter installed");
        setter.set(false);
        assert!(!manager.is_focused());
        setter.set(true);
        assert!(manager.is_focused());
    }

    #[test]
    fn test_replacing_event_listener_tears_down_previous() {
        let manager = FocusManager::new();
        let torn_down = Arc::new(AtomicUsize::new(0));

        let t = torn_down.clone();
        manager.set_event_listener(move |_| {
            Box::new(move || {
                t.fetch_add(1, Ordering::Relaxed);
            })
        });
        assert_eq!(torn_down.load(Ordering::Relaxed), 0);

        manager.set_event_listener(|_| Box::new(|| {}));
        assert_eq!(torn_down.load(Ordering::Relaxed), 1);
    }
}
