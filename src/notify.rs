//! Batched notification scheduling.
//!
//! State transitions often touch several observers at once. Writes performed
//! inside a [`NotifyManager::batch`] region coalesce their listener
//! notifications into one pass that runs when the outermost batch exits, so
//! subscribers observe a settled view instead of every intermediate step.
//! Notifications scheduled outside a batch run immediately.

use std::mem;

use parking_lot::Mutex;

type Notification = Box<dyn FnOnce() + Send>;

pub struct NotifyManager {
    queue: Mutex<Vec<Notification>>,
    depth: Mutex<usize>,
}

impl NotifyManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            depth: Mutex::new(0),
        }
    }

    /// Runs `f` with notification delivery deferred until the outermost
    /// batch exits. Batches nest.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        *self.depth.lock() += 1;
        let output = f();
        let flush = {
            let mut depth = self.depth.lock();
            *depth -= 1;
            *depth == 0
        };
        if flush {
            self.flush();
        }
        output
    }

    /// Schedules a notification: queued while a batch is open, run inline
    /// otherwise.
    pub fn schedule(&self, notification: impl FnOnce() + Send + 'static) {
        let batching = *self.depth.lock() > 0;
        if batching {
            self.queue.lock().push(Box::new(notification));
        } else {
            notification();
        }
    }

    /// Drains the queue. Notifications enqueued by listeners that write to
    /// the cache while being notified join the drain and run after the
    /// in-flight pass finishes.
    fn flush(&self) {
        loop {
            let batch: Vec<Notification> = mem::take(&mut *self.queue.lock());
            if batch.is_empty() {
                break;
            }
            *self.depth.lock() += 1;
            for notification in batch {
                notification();
            }
            *self.depth.lock() -= 1;
        }
    }
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_schedule_outside_batch_runs_inline() {
        let manager = NotifyManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        manager.schedule(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_batch_defers_until_exit() {
        let manager = NotifyManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        manager.batch(|| {
            manager.schedule(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), 0);
        });

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_nested_batches_flush_once() {
        let manager = NotifyManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let outer = order.clone();
        let inner = order.clone();
        manager.batch(|| {
            manager.schedule(move || outer.lock().push("outer"));
            manager.batch(|| {
                manager.schedule(move || inner.lock().push("inner"));
            });
            assert!(order.lock().is_empty());
        });

        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_batch_returns_value() {
        let manager = NotifyManager::new();
        let value = manager.batch(|| 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_reentrant_schedule_during_flush_is_drained() {
        let manager = Arc::new(NotifyManager::new());
        let count = Arc::new(AtomicUsize::new(0));

        let m = manager.clone();
        let c = count.clone();
        manager.batch(|| {
            manager.schedule(move || {
                c.fetch_add(1, Ordering::Relaxed);
                let c2 = c.clone();
                // A listener writing to the cache mid-notification lands in
                // the same drain.
                m.schedule(move || {
                    c2.fetch_add(1, Ordering::Relaxed);
                });
            });
        });

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
