//! Ambient "online" signal.
//!
//! The counterpart to [`crate::focus`]: an embedding plugs in a
//! connectivity event source and the manager broadcasts transitions.
//! Network-mode gates in the retry machinery consult this signal to decide
//! whether a fetch may run or must pause. The default is online.

use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::focus::Teardown;
use crate::listeners::ListenerSet;

/// Handle given to an event source for feeding connectivity changes back in.
#[derive(Clone)]
pub struct OnlineSetter {
    manager: Weak<OnlineManager>,
}

impl OnlineSetter {
    pub fn set(&self, online: bool) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_online(online);
        }
    }
}

pub struct OnlineManager {
    online: AtomicBool,
    listeners: ListenerSet<bool>,
    teardown: Mutex<Option<Teardown>>,
}

impl OnlineManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            listeners: ListenerSet::new(),
            teardown: Mutex::new(None),
        })
    }

    /// Installs the environment-specific event source, replacing (and
    /// tearing down) any previous one.
    pub fn set_event_listener<F>(self: &Arc<Self>, setup: F)
    where
        F: FnOnce(OnlineSetter) -> Teardown,
    {
        let setter = OnlineSetter {
            manager: Arc::downgrade(self),
        };
        let teardown = setup(setter);
        let previous = self.teardown.lock().replace(teardown);
        if let Some(previous) = previous {
            previous();
        }
    }

    /// Overrides the online state. Listeners are notified only on
    /// transitions.
    pub fn set_online(&self, online: bool) {
        let before = self.online.swap(online, Ordering::SeqCst);
        if before != online {
            self.listeners.emit(&online);
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        self.listeners.subscribe(move |online| listener(*online))
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.unsubscribe(id)
    }
}

/// The process-wide online manager.
#[must_use]
pub fn online_manager() -> Arc<OnlineManager> {
    static GLOBAL: OnceLock<Arc<OnlineManager>> = OnceLock::new();
    GLOBAL.get_or_init(OnlineManager::new).clone()
}
