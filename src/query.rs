//! A single cache entry and its fetch orchestration.
//!
//! A query owns the state machine for one keyed asynchronous read: a reducer
//! over fetch lifecycle actions, the retryer driving the in-flight attempt,
//! the shared promise concurrent callers dedupe onto, and the gc countdown
//! that collects the entry once nobody observes it. Every state transition
//! fans out to the query's observers and to the cache's subscribers in one
//! notification batch.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CancelOptions, QueryError};
use crate::gc::GcTimer;
use crate::key::QueryKey;
use crate::online::OnlineManager;
use crate::options::{QueryFn, QueryFnContext, QueryOptions, StaleTime};
use crate::query_cache::{QueryCache, QueryCacheEvent};
use crate::query_observer::QueryObserver;
use crate::retry::{AbortSignal, Retryer, RetryerConfig, RetryerHandle};
use crate::sharing::SharedData;

/// The in-flight (or settled) fetch future, shared by every caller.
pub type QueryPromise = Shared<BoxFuture<'static, Result<SharedData, QueryError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No successful data has ever been produced.
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// A retryer exists but the network mode disallows progress.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Metadata describing why a fetch runs; page walks set the direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchMeta {
    pub direction: Option<FetchDirection>,
}

/// Options for one `fetch` call.
#[derive(Clone, Debug)]
pub struct FetchOptions {
    /// Cancel an already-running fetch before starting, when the query
    /// already has data. Defaults to `true`.
    pub cancel_refetch: bool,
    pub meta: Option<FetchMeta>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            meta: None,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn keep_current_fetch() -> Self {
        Self {
            cancel_refetch: false,
            meta: None,
        }
    }
}

/// The full state of one query.
#[derive(Clone)]
pub struct QueryState {
    pub data: Option<SharedData>,
    pub data_update_count: u64,
    pub data_updated_at: Option<Instant>,
    pub error: Option<QueryError>,
    pub error_update_count: u64,
    pub error_updated_at: Option<Instant>,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<QueryError>,
    pub fetch_meta: Option<FetchMeta>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl QueryState {
    pub(crate) fn initial(options: &QueryOptions) -> Self {
        let data = options.initial_data.as_ref().and_then(|initial| initial.resolve());
        let has_data = data.is_some();
        Self {
            data,
            data_update_count: 0,
            data_updated_at: if has_data {
                options.initial_data_updated_at
            } else {
                None
            },
            error: None,
            error_update_count: 0,
            error_updated_at: None,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: if has_data {
                QueryStatus::Success
            } else {
                QueryStatus::Pending
            },
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("has_data", &self.data.is_some())
            .field("data_update_count", &self.data_update_count)
            .field("error", &self.error)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .finish_non_exhaustive()
    }
}

/// Actions the query reducer understands.
#[derive(Clone)]
pub enum QueryAction {
    Fetch {
        meta: Option<FetchMeta>,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Success {
        data: SharedData,
        data_updated_at: Option<Instant>,
        /// Set for cache writes that bypass the fetch pipeline; they leave
        /// the fetch status untouched.
        manual: bool,
    },
    Error {
        error: QueryError,
    },
    Invalidate,
    SetState {
        state: QueryState,
    },
}

impl std::fmt::Debug for QueryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fetch { .. } => "Fetch",
            Self::Failed { .. } => "Failed",
            Self::Pause => "Pause",
            Self::Continue => "Continue",
            Self::Success { .. } => "Success",
            Self::Error { .. } => "Error",
            Self::Invalidate => "Invalidate",
            Self::SetState { .. } => "SetState",
        };
        f.write_str(name)
    }
}

/// Options for a direct cache write.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetDataOptions {
    pub updated_at: Option<Instant>,
}

pub(crate) type FetchFn = Box<dyn FnMut() -> BoxFuture<'static, Result<SharedData, QueryError>> + Send>;

/// Mutable view of an upcoming fetch, given to a fetch behavior before the
/// retryer starts.
pub struct FetchContext {
    pub(crate) fetch_fn: FetchFn,
    pub(crate) options: QueryOptions,
    pub(crate) query_key: QueryKey,
    pub(crate) state: QueryState,
    pub(crate) signal: AbortSignal,
    pub(crate) meta: Option<FetchMeta>,
}

impl FetchContext {
    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    #[must_use]
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    #[must_use]
    pub fn state(&self) -> &QueryState {
        &self.state
    }

    #[must_use]
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    #[must_use]
    pub fn meta(&self) -> Option<FetchMeta> {
        self.meta
    }

    /// Replaces the function the retryer will attempt.
    pub fn set_fetch_fn(
        &mut self,
        fetch_fn: impl FnMut() -> BoxFuture<'static, Result<SharedData, QueryError>> + Send + 'static,
    ) {
        self.fetch_fn = Box::new(fetch_fn);
    }
}

/// Hook that customises how a query fetches (page walking for infinite
/// queries).
pub trait FetchBehavior: Send + Sync {
    fn on_fetch(&self, context: &mut FetchContext);
}

/// One cache entry.
pub struct Query {
    query_hash: String,
    query_key: QueryKey,
    cache: Weak<QueryCache>,
    online: Arc<OnlineManager>,
    options: Mutex<QueryOptions>,
    state: Mutex<QueryState>,
    initial_state: QueryState,
    revert_state: Mutex<Option<QueryState>>,
    observers: Mutex<Vec<Weak<QueryObserver>>>,
    retryer: Mutex<Option<RetryerHandle>>,
    promise: Mutex<Option<QueryPromise>>,
    abort_signal: Mutex<Option<AbortSignal>>,
    gc: GcTimer,
}

impl Query {
    pub(crate) fn new(
        cache: &Arc<QueryCache>,
        online: Arc<OnlineManager>,
        query_hash: String,
        query_key: QueryKey,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Arc<Self> {
        let initial_state = state.unwrap_or_else(|| QueryState::initial(&options));
        Arc::new(Self {
            query_hash,
            query_key,
            cache: Arc::downgrade(cache),
            online,
            options: Mutex::new(options),
            state: Mutex::new(initial_state.clone()),
            initial_state,
            revert_state: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            promise: Mutex::new(None),
            abort_signal: Mutex::new(None),
            gc: GcTimer::new(),
        })
    }

    #[must_use]
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    #[must_use]
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    /// The current in-flight (or last settled) fetch promise.
    #[must_use]
    pub fn promise(&self) -> Option<QueryPromise> {
        self.promise.lock().clone()
    }

    /// Replaces the options, retaining the longest gc window any observer
    /// ever asked for.
    pub(crate) fn set_options(&self, options: Option<&QueryOptions>) {
        let mut slot = self.options.lock();
        let current_gc = slot.resolved_gc_time();
        if let Some(options) = options {
            *slot = options.clone();
        }
        let retained = current_gc.max(slot.resolved_gc_time());
        slot.gc_time = Some(retained);
    }

    pub(crate) fn observers(&self) -> Vec<Arc<QueryObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn observers_count(&self) -> usize {
        self.observers().len()
    }

    /// A query is active while any observer considers it enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observers().iter().any(|observer| observer.is_enabled())
    }

    /// Disabled queries are skipped by refetch sweeps: every observer has
    /// opted out, or the query never fetched and cannot (skip token, no
    /// observers).
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        if self.observers_count() > 0 {
            return !self.is_active();
        }
        let state = self.state();
        self.options().is_skip()
            || (state.data_update_count == 0 && state.error_update_count == 0)
    }

    /// Whether the resolved stale time marks this query as never stale.
    #[must_use]
    pub fn is_static(&self) -> bool {
        let options = self.options();
        options
            .stale_time
            .as_ref()
            .is_some_and(|stale_time| stale_time.resolve(self).is_static())
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        let observers = self.observers();
        if !observers.is_empty() {
            return observers
                .iter()
                .any(|observer| observer.current_result_is_stale());
        }
        let stale_time = self
            .options()
            .stale_time
            .clone()
            .unwrap_or(StaleTime::After(std::time::Duration::ZERO));
        self.is_stale_by_time(&stale_time)
    }

    /// Staleness against an explicit window. `Static` data is never stale
    /// (not even when invalidated); otherwise invalidation, missing data, or
    /// an elapsed window make the query stale.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: &StaleTime) -> bool {
        let stale_time = stale_time.resolve(self);
        let state = self.state();
        if stale_time.is_static() {
            return state.data.is_none();
        }
        if state.data.is_none() || state.is_invalidated {
            return true;
        }
        match (stale_time, state.data_updated_at) {
            (StaleTime::After(window), Some(updated_at)) => {
                Instant::now().duration_since(updated_at) >= window
            }
            _ => true,
        }
    }

    pub fn add_observer(self: &Arc<Self>, observer: &Arc<QueryObserver>) {
        {
            let mut observers = self.observers.lock();
            let incoming = Arc::downgrade(observer);
            if !observers.iter().any(|weak| weak.ptr_eq(&incoming)) {
                observers.push(incoming);
            }
        }
        self.gc.cancel();
        self.notify_cache(QueryCacheEvent::ObserverAdded {
            query: self.clone(),
        });
    }

    pub fn remove_observer(self: &Arc<Self>, observer: &Arc<QueryObserver>) {
        let remaining = {
            let mut observers = self.observers.lock();
            let leaving = Arc::downgrade(observer);
            observers.retain(|weak| !weak.ptr_eq(&leaving) && weak.strong_count() > 0);
            observers.len()
        };

        if remaining == 0 {
            if let Some(handle) = self.retryer.lock().clone() {
                let consumed = self
                    .abort_signal
                    .lock()
                    .as_ref()
                    .is_some_and(AbortSignal::is_consumed);
                if consumed {
                    handle.cancel(CancelOptions {
                        revert: true,
                        silent: false,
                    });
                } else {
                    // keep the fetch alive to populate the cache, but stop
                    // retrying once it fails
                    handle.cancel_retry();
                }
            }
            self.schedule_gc();
        }

        self.notify_cache(QueryCacheEvent::ObserverRemoved {
            query: self.clone(),
        });
    }

    /// Starts a fetch, or joins the in-flight one.
    pub fn fetch(
        self: &Arc<Self>,
        observer_options: Option<&QueryOptions>,
        fetch_options: FetchOptions,
    ) -> QueryPromise {
        let state = self.state();
        if state.fetch_status != FetchStatus::Idle {
            if state.data_updated_at.is_some() && fetch_options.cancel_refetch {
                self.cancel_fetch(CancelOptions::silent());
            } else if let Some(promise) = self.promise() {
                if let Some(handle) = self.retryer.lock().clone() {
                    handle.continue_retry();
                }
                return promise;
            }
        }

        if observer_options.is_some() {
            self.set_options(observer_options);
        }
        let options = self.options();

        let abort = AbortSignal::new();
        *self.abort_signal.lock() = Some(abort.clone());

        let mut context = FetchContext {
            fetch_fn: default_fetch_fn(&options, &self.query_hash, &self.query_key, &abort),
            options: options.clone(),
            query_key: self.query_key.clone(),
            state: state.clone(),
            signal: abort.clone(),
            meta: fetch_options.meta,
        };
        if let Some(behavior) = options.behavior.clone() {
            behavior.on_fetch(&mut context);
        }

        *self.revert_state.lock() = Some(state);
        self.dispatch(QueryAction::Fetch {
            meta: fetch_options.meta,
        });

        let weak = Arc::downgrade(self);
        let mut config = RetryerConfig::new(context.fetch_fn, self.online.clone());
        config.abort = Some(Box::new({
            let abort = abort.clone();
            move || abort.abort()
        }));
        config.on_fail = Some(Box::new({
            let weak = weak.clone();
            move |failure_count, error| {
                if let Some(query) = weak.upgrade() {
                    query.dispatch(QueryAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }
        }));
        config.on_pause = Some(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(query) = weak.upgrade() {
                    query.dispatch(QueryAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(query) = weak.upgrade() {
                    query.dispatch(QueryAction::Continue);
                }
            }
        }));
        config.retry = options.resolved_retry();
        config.retry_delay = options.resolved_retry_delay();
        config.network_mode = options.resolved_network_mode();

        let (handle, retry_future) = Retryer::start(config);
        *self.retryer.lock() = Some(handle.clone());

        let (tx, rx) = oneshot::channel::<Result<SharedData, QueryError>>();
        let promise: QueryPromise = async move {
            rx.await
                .unwrap_or_else(|_| Err(QueryError::Cancelled(CancelOptions::silent())))
        }
        .boxed()
        .shared();
        *self.promise.lock() = Some(promise.clone());

        let query = self.clone();
        tokio::spawn(async move {
            let outcome = retry_future.await;
            let settled = query.on_fetch_settled(&handle, outcome);
            let _ = tx.send(settled);
        });

        promise
    }

    /// Finalises a settled fetch: state dispatch, cache callbacks, logging,
    /// gc. Stale tasks (replaced by a newer fetch) only report their own
    /// outcome.
    fn on_fetch_settled(
        self: &Arc<Self>,
        handle: &RetryerHandle,
        outcome: Result<SharedData, QueryError>,
    ) -> Result<SharedData, QueryError> {
        let is_current = {
            let mut slot = self.retryer.lock();
            let current = slot.as_ref().is_some_and(|active| active.same(handle));
            if current {
                *slot = None;
            }
            current
        };

        let settled = match outcome {
            Ok(data) => {
                let merged = self.set_data_internal(data, None, false);
                if let Some(cache) = self.cache.upgrade() {
                    cache.on_query_success(&merged, self);
                }
                Ok(merged)
            }
            Err(error) => {
                match error.cancel_options() {
                    Some(options) if options.revert => {
                        if is_current {
                            let revert = self.revert_state.lock().clone();
                            if let Some(state) = revert {
                                self.dispatch(QueryAction::SetState { state });
                            }
                        }
                    }
                    Some(options) if options.silent => {}
                    _ => {
                        if is_current {
                            self.dispatch(QueryAction::Error {
                                error: error.clone(),
                            });
                            if let Some(cache) = self.cache.upgrade() {
                                cache.on_query_error(&error, self);
                            }
                            if self.observers_count() == 0 {
                                tracing::error!(
                                    query_hash = %self.query_hash,
                                    error = %error,
                                    "unobserved query fetch failed"
                                );
                            }
                        }
                    }
                }
                Err(error)
            }
        };

        if self.observers_count() == 0 {
            self.schedule_gc();
        }
        settled
    }

    /// Writes data into the entry, applying structural sharing.
    pub fn set_data(self: &Arc<Self>, data: SharedData, options: SetDataOptions) -> SharedData {
        self.set_data_internal(data, options.updated_at, true)
    }

    fn set_data_internal(
        self: &Arc<Self>,
        data: SharedData,
        updated_at: Option<Instant>,
        manual: bool,
    ) -> SharedData {
        let previous = self.state().data;
        let merged = self
            .options()
            .resolved_structural_sharing()
            .merge(previous.as_ref(), data);
        self.dispatch(QueryAction::Success {
            data: merged.clone(),
            data_updated_at: updated_at,
            manual,
        });
        merged
    }

    pub fn set_state(self: &Arc<Self>, state: QueryState) {
        self.dispatch(QueryAction::SetState { state });
    }

    pub fn invalidate(self: &Arc<Self>) {
        if !self.state().is_invalidated {
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// Cancels the in-flight fetch (if any) and waits for it to settle.
    pub async fn cancel(self: &Arc<Self>, options: CancelOptions) {
        let promise = self.promise();
        self.cancel_fetch(options);
        if let Some(promise) = promise {
            let _ = promise.await;
        }
    }

    fn cancel_fetch(&self, options: CancelOptions) {
        if let Some(handle) = self.retryer.lock().clone() {
            handle.cancel(options);
        }
    }

    /// Restores the entry to its initial state.
    pub fn reset(self: &Arc<Self>) {
        self.gc.cancel();
        self.cancel_fetch(CancelOptions::silent());
        self.dispatch(QueryAction::SetState {
            state: self.initial_state.clone(),
        });
    }

    /// Tears the entry down when it leaves the cache.
    pub(crate) fn destroy(&self) {
        self.gc.cancel();
        self.cancel_fetch(CancelOptions::silent());
    }

    pub(crate) fn on_focus(self: &Arc<Self>) {
        let observer = self
            .observers()
            .into_iter()
            .find(|observer| observer.should_fetch_on_window_focus());
        if let Some(observer) = observer {
            observer.trigger_refetch(FetchOptions::keep_current_fetch());
        }
        if let Some(handle) = self.retryer.lock().clone() {
            handle.resume();
        }
    }

    pub(crate) fn on_online(self: &Arc<Self>) {
        let observer = self
            .observers()
            .into_iter()
            .find(|observer| observer.should_fetch_on_reconnect());
        if let Some(observer) = observer {
            observer.trigger_refetch(FetchOptions::keep_current_fetch());
        }
        if let Some(handle) = self.retryer.lock().clone() {
            handle.resume();
        }
    }

    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.gc.schedule(self.options().resolved_gc_time(), move || {
            if let Some(query) = weak.upgrade() {
                query.try_evict();
            }
        });
    }

    fn try_evict(self: &Arc<Self>) {
        if self.observers().is_empty() && self.state().fetch_status == FetchStatus::Idle {
            if let Some(cache) = self.cache.upgrade() {
                cache.remove(self);
            }
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, action: QueryAction) {
        {
            let mut state = self.state.lock();
            let next = self.reduce(&state, &action);
            *state = next;
        }

        if let Some(cache) = self.cache.upgrade() {
            let query = self.clone();
            cache.notify_manager().batch(|| {
                for observer in query.observers() {
                    observer.on_query_update();
                }
                cache.notify(QueryCacheEvent::Updated { query, action });
            });
        } else {
            for observer in self.observers() {
                observer.on_query_update();
            }
        }
    }

    fn reduce(&self, state: &QueryState, action: &QueryAction) -> QueryState {
        let mut next = state.clone();
        match action {
            QueryAction::Fetch { meta } => {
                let can_fetch = self
                    .options()
                    .resolved_network_mode()
                    .can_start(self.online.is_online());
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
                next.fetch_meta = *meta;
                next.fetch_status = if can_fetch {
                    FetchStatus::Fetching
                } else {
                    FetchStatus::Paused
                };
                if state.data.is_none() {
                    next.error = None;
                    next.status = QueryStatus::Pending;
                }
            }
            QueryAction::Failed {
                failure_count,
                error,
            } => {
                next.fetch_failure_count = *failure_count;
                next.fetch_failure_reason = Some(error.clone());
            }
            QueryAction::Pause => {
                next.fetch_status = FetchStatus::Paused;
            }
            QueryAction::Continue => {
                next.fetch_status = FetchStatus::Fetching;
            }
            QueryAction::Success {
                data,
                data_updated_at,
                manual,
            } => {
                next.data = Some(data.clone());
                next.data_update_count = state.data_update_count + 1;
                next.data_updated_at = Some(data_updated_at.unwrap_or_else(Instant::now));
                next.error = None;
                next.is_invalidated = false;
                next.status = QueryStatus::Success;
                if !manual {
                    next.fetch_status = FetchStatus::Idle;
                    next.fetch_failure_count = 0;
                    next.fetch_failure_reason = None;
                }
            }
            QueryAction::Error { error } => {
                next.error = Some(error.clone());
                next.error_update_count = state.error_update_count + 1;
                next.error_updated_at = Some(Instant::now());
                next.fetch_failure_count = state.fetch_failure_count + 1;
                next.fetch_failure_reason = Some(error.clone());
                next.fetch_status = FetchStatus::Idle;
                next.status = QueryStatus::Error;
            }
            QueryAction::Invalidate => {
                next.is_invalidated = true;
            }
            QueryAction::SetState { state } => {
                next = state.clone();
            }
        }
        next
    }

    fn notify_cache(&self, event: QueryCacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify(event);
        }
    }
}

fn default_fetch_fn(
    options: &QueryOptions,
    query_hash: &str,
    query_key: &QueryKey,
    signal: &AbortSignal,
) -> FetchFn {
    let query_fn = options.query_fn.clone();
    let meta = options.meta.clone();
    let query_key = query_key.clone();
    let query_hash: Arc<str> = Arc::from(query_hash);
    let signal = signal.clone();

    Box::new(move || match &query_fn {
        Some(QueryFn::Run(run)) => run(QueryFnContext::new(
            query_key.clone(),
            meta.clone(),
            None,
            signal.clone(),
        )),
        _ => {
            let query_hash = query_hash.clone();
            async move { Err(QueryError::MissingQueryFn(query_hash)) }.boxed()
        }
    })
}
