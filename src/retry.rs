//! Pause-capable, cancel-capable retrying task wrapper.
//!
//! A retryer drives a fallible async task to completion: on failure it
//! consults the retry policy, sleeps out the retry delay, and tries again.
//! Before the first attempt and before every retry it evaluates the network
//! mode against the ambient online signal (and the caller's `can_run` gate);
//! when the gate is closed the loop parks in a paused state until an
//! external `resume` arrives. Cancellation, retry suppression and resumption
//! all travel over one watch channel the loop selects on, so a parked or
//! sleeping retryer reacts immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};

use crate::error::{CancelOptions, QueryError};
use crate::online::OnlineManager;

/// Policy deciding whether a task runs, pauses, or always proceeds relative
/// to the online signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    /// Requires connectivity; pauses otherwise.
    #[default]
    Online,
    /// Never pauses.
    Always,
    /// The first attempt runs regardless of connectivity; retries pause
    /// while offline.
    OfflineFirst,
}

impl NetworkMode {
    pub(crate) fn can_start(self, online: bool) -> bool {
        match self {
            Self::Online => online,
            Self::Always | Self::OfflineFirst => true,
        }
    }

    pub(crate) fn can_continue(self, online: bool) -> bool {
        match self {
            Self::Online | Self::OfflineFirst => online,
            Self::Always => true,
        }
    }
}

/// How many times a failed task is re-attempted.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Retry up to `n` times after the initial attempt.
    Count(u32),
    Infinite,
    /// Decide per failure from `(failure_count, error)`.
    Decide(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    pub(crate) fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Count(retries) => failure_count <= *retries,
            Self::Infinite => true,
            Self::Decide(decide) => decide(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl From<u32> for RetryPolicy {
    fn from(retries: u32) -> Self {
        Self::Count(retries)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry { Self::Infinite } else { Self::Count(0) }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(retries) => write!(f, "RetryPolicy::Count({retries})"),
            Self::Infinite => f.write_str("RetryPolicy::Infinite"),
            Self::Decide(_) => f.write_str("RetryPolicy::Decide"),
        }
    }
}

/// How long to wait before a retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// Doubling backoff starting at `base`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    Compute(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub(crate) fn delay_for(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let exponent = failure_count.saturating_sub(1).min(16);
                base.saturating_mul(1 << exponent).min(*max)
            }
            Self::Compute(compute) => compute(failure_count, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(delay) => write!(f, "RetryDelay::Fixed({delay:?})"),
            Self::Exponential { base, max } => {
                write!(f, "RetryDelay::Exponential({base:?}, {max:?})")
            }
            Self::Compute(_) => f.write_str("RetryDelay::Compute"),
        }
    }
}

/// Cooperative cancellation token handed to query functions.
///
/// The engine tracks whether a query function ever looked at its token; a
/// fetch whose token was never consumed is kept alive to completion when its
/// last observer goes away, so the cache still gets populated.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    consumed: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                consumed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Completes once the fetch is aborted.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn mark_consumed(&self) {
        self.inner.consumed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.inner.consumed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default)]
struct ControlState {
    cancelled: Option<CancelOptions>,
    retry_cancelled: bool,
    resume_epoch: u64,
}

/// Shared control over a running retryer.
#[derive(Clone)]
pub(crate) struct RetryerHandle {
    tx: Arc<watch::Sender<ControlState>>,
    paused: Arc<AtomicBool>,
    resolved: Arc<AtomicBool>,
}

impl RetryerHandle {
    /// Cancels the task. The first cancellation wins; its options decide
    /// revert/silent handling downstream.
    pub(crate) fn cancel(&self, options: CancelOptions) {
        self.tx.send_modify(|state| {
            if state.cancelled.is_none() {
                state.cancelled = Some(options);
            }
        });
    }

    /// Wakes a paused retryer so it can re-evaluate its gate.
    pub(crate) fn resume(&self) {
        self.tx.send_modify(|state| state.resume_epoch += 1);
    }

    /// Stops further retries; the current (or last) error becomes terminal.
    pub(crate) fn cancel_retry(&self) {
        self.tx.send_modify(|state| state.retry_cancelled = true);
    }

    /// Re-allows retries after [`RetryerHandle::cancel_retry`].
    pub(crate) fn continue_retry(&self) {
        self.tx.send_modify(|state| state.retry_cancelled = false);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    pub(crate) fn same(&self, other: &RetryerHandle) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

pub(crate) struct RetryerConfig<T> {
    /// Produces one attempt of the underlying task.
    pub task: Box<dyn FnMut() -> BoxFuture<'static, Result<T, QueryError>> + Send>,
    /// Invoked when a cancellation interrupts an in-flight attempt.
    pub abort: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_fail: Option<Box<dyn Fn(u32, &QueryError) + Send + Sync>>,
    pub on_pause: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_continue: Option<Box<dyn Fn() + Send + Sync>>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    /// Extra gate evaluated alongside the network mode (scope serialization
    /// for mutations).
    pub can_run: Box<dyn Fn() -> bool + Send + Sync>,
    pub online: Arc<OnlineManager>,
}

impl<T> RetryerConfig<T> {
    pub(crate) fn new(
        task: impl FnMut() -> BoxFuture<'static, Result<T, QueryError>> + Send + 'static,
        online: Arc<OnlineManager>,
    ) -> Self {
        Self {
            task: Box::new(task),
            abort: None,
            on_fail: None,
            on_pause: None,
            on_continue: None,
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            can_run: Box::new(|| true),
            online,
        }
    }

    fn can_proceed(&self, first_attempt: bool) -> bool {
        let online = self.online.is_online();
        let network_open = if first_attempt {
            self.network_mode.can_start(online)
        } else {
            self.network_mode.can_continue(online)
        };
        network_open && (self.can_run)()
    }
}

pub(crate) struct Retryer;

impl Retryer {
    /// Builds the retry loop. The returned future must be driven (usually on
    /// a spawned task); the handle controls it from outside.
    pub(crate) fn start<T: Send + 'static>(
        config: RetryerConfig<T>,
    ) -> (RetryerHandle, BoxFuture<'static, Result<T, QueryError>>) {
        let (tx, rx) = watch::channel(ControlState::default());
        let handle = RetryerHandle {
            tx: Arc::new(tx),
            paused: Arc::new(AtomicBool::new(false)),
            resolved: Arc::new(AtomicBool::new(false)),
        };

        let loop_handle = handle.clone();
        let future = async move {
            let mut config = config;
            let mut rx = rx;
            let result = drive(&mut config, &loop_handle, &mut rx).await;
            loop_handle.resolved.store(true, Ordering::SeqCst);
            result
        }
        .boxed();

        (handle, future)
    }
}

async fn drive<T>(
    config: &mut RetryerConfig<T>,
    handle: &RetryerHandle,
    rx: &mut watch::Receiver<ControlState>,
) -> Result<T, QueryError> {
    let mut failure_count: u32 = 0;

    if !config.can_proceed(true) {
        pause(config, handle, rx).await?;
    }

    loop {
        if let Some(options) = current_cancel(rx) {
            return Err(QueryError::Cancelled(options));
        }

        let attempt = (config.task)();
        let outcome = tokio::select! {
            result = attempt => result,
            options = wait_cancelled(rx) => {
                if let Some(abort) = &config.abort {
                    abort();
                }
                return Err(QueryError::Cancelled(options));
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) => {
                if let Some(options) = current_cancel(rx) {
                    return Err(QueryError::Cancelled(options));
                }

                failure_count += 1;
                if retry_cancelled(rx) || !config.retry.should_retry(failure_count, &error) {
                    return Err(error);
                }
                if let Some(on_fail) = &config.on_fail {
                    on_fail(failure_count, &error);
                }

                let delay = config.retry_delay.delay_for(failure_count, &error);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    options = wait_cancelled(rx) => {
                        return Err(QueryError::Cancelled(options));
                    }
                }
                if retry_cancelled(rx) {
                    return Err(error);
                }

                if !config.can_proceed(false) {
                    pause(config, handle, rx).await?;
                }
            }
        }
    }
}

/// Parks until an external resume arrives while the gate is open, or until
/// cancellation.
async fn pause<T>(
    config: &mut RetryerConfig<T>,
    handle: &RetryerHandle,
    rx: &mut watch::Receiver<ControlState>,
) -> Result<(), QueryError> {
    handle.paused.store(true, Ordering::SeqCst);
    if let Some(on_pause) = &config.on_pause {
        on_pause();
    }

    let mut seen_epoch = rx.borrow().resume_epoch;
    let outcome = loop {
        let (cancelled, epoch) = {
            let state = rx.borrow();
            (state.cancelled, state.resume_epoch)
        };
        if let Some(options) = cancelled {
            break Err(QueryError::Cancelled(options));
        }
        if epoch != seen_epoch {
            seen_epoch = epoch;
            if config.can_proceed(false) {
                break Ok(());
            }
        }
        if rx.changed().await.is_err() {
            break Err(QueryError::Cancelled(CancelOptions::silent()));
        }
    };

    handle.paused.store(false, Ordering::SeqCst);
    if outcome.is_ok() {
        if let Some(on_continue) = &config.on_continue {
            on_continue();
        }
    }
    outcome
}

fn current_cancel(rx: &watch::Receiver<ControlState>) -> Option<CancelOptions> {
    rx.borrow().cancelled
}

fn retry_cancelled(rx: &watch::Receiver<ControlState>) -> bool {
    rx.borrow().retry_cancelled
}

async fn wait_cancelled(rx: &mut watch::Receiver<ControlState>) -> CancelOptions {
    loop {
        {
            if let Some(options) = rx.borrow().cancelled {
                return options;
            }
        }
        if rx.changed().await.is_err() {
            return CancelOptions::silent();
        }
    }
}
