//! Collection timers for observer-less cache entries.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// How long an entry without observers is retained before collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTime {
    After(Duration),
    /// Never collect; the entry stays until removed explicitly.
    Never,
}

impl GcTime {
    pub(crate) const DEFAULT: GcTime = GcTime::After(Duration::from_secs(5 * 60));

    /// The larger of two retention windows. Entries keep the longest window
    /// any of their observers ever asked for.
    #[must_use]
    pub(crate) fn max(self, other: GcTime) -> GcTime {
        match (self, other) {
            (GcTime::Never, _) | (_, GcTime::Never) => GcTime::Never,
            (GcTime::After(a), GcTime::After(b)) => GcTime::After(a.max(b)),
        }
    }
}

impl From<Duration> for GcTime {
    fn from(duration: Duration) -> Self {
        GcTime::After(duration)
    }
}

/// A slot holding at most one background task; replacing or dropping the
/// slot aborts the previous task.
pub(crate) struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Spawns `future`, aborting whatever occupied the slot. Outside a
    /// runtime the slot stays empty.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.abort();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            *self.handle.lock() = Some(runtime.spawn(future));
        }
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

/// Countdown that fires an eviction callback once the retention window of an
/// observer-less entry elapses.
pub(crate) struct GcTimer {
    slot: TaskSlot,
}

impl GcTimer {
    pub(crate) fn new() -> Self {
        Self {
            slot: TaskSlot::new(),
        }
    }

    /// Restarts the countdown. [`GcTime::Never`] leaves the timer disarmed.
    pub(crate) fn schedule(&self, gc_time: GcTime, on_expire: impl FnOnce() + Send + 'static) {
        self.cancel();
        let GcTime::After(delay) = gc_time else {
            return;
        };
        self.slot.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expire();
        });
    }

    pub(crate) fn cancel(&self) {
        self.slot.abort();
    }
}
