//! The per-subscriber view of a query.
//!
//! An observer derives a presentable result from its query (select
//! transforms, placeholder data, staleness flags), decides when the query
//! should fetch (mount, options changes, focus, reconnect, interval), and
//! suppresses notifications for fields its consumer never read.
//!
//! # Tracked properties
//!
//! Consumers read result fields through [`QueryObserver::track_result`];
//! every accessor records its field. When a new result differs from the
//! previous one only in untracked fields, listeners are not notified.
//! `notify_on_change_props` overrides the recorded set.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::gc::TaskSlot;
use crate::listeners::ListenerSet;
use crate::options::{NotifyOnChangeProps, PlaceholderData, QueryOptions, RefetchOn, SelectFn, StaleTime};
use crate::query::{FetchOptions, FetchStatus, Query, QueryPromise, QueryStatus};
use crate::query_cache::QueryCacheEvent;
use crate::sharing::{SharedData, downcast};

/// Fields of a [`QueryObserverResult`], used for tracked-property change
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
    Data,
    DataUpdatedAt,
    Error,
    ErrorUpdatedAt,
    FailureCount,
    FailureReason,
    Status,
    FetchStatus,
    IsPending,
    IsLoading,
    IsFetching,
    IsPaused,
    IsSuccess,
    IsError,
    IsStale,
    IsPlaceholderData,
    Promise,
}

/// Clonable handle that refetches through its observer; usable after being
/// detached from the result struct.
#[derive(Clone)]
pub struct Refetch {
    observer: Weak<QueryObserver>,
}

impl Refetch {
    /// Runs a refetch and resolves with the observer's settled result, or
    /// `None` if the observer is gone.
    pub async fn call(&self) -> Option<QueryObserverResult> {
        match self.observer.upgrade() {
            Some(observer) => Some(observer.refetch().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for Refetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Refetch")
    }
}

/// The derived, observable result of one query subscription.
#[derive(Clone)]
pub struct QueryObserverResult {
    pub data: Option<SharedData>,
    pub data_updated_at: Option<Instant>,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub is_pending: bool,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_paused: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_loading_error: bool,
    pub is_refetch_error: bool,
    pub is_refetching: bool,
    pub is_fetched: bool,
    pub is_fetched_after_mount: bool,
    pub is_stale: bool,
    pub is_placeholder_data: bool,
    /// Whether `throw_on_error` instructs the subscriber to re-throw.
    pub should_throw: bool,
    /// The in-flight fetch promise, stable across result recomputations of
    /// the same fetch.
    pub promise: Option<QueryPromise>,
    pub refetch: Refetch,
}

impl QueryObserverResult {
    #[must_use]
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.as_ref().and_then(downcast::<T>)
    }
}

impl std::fmt::Debug for QueryObserverResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("failure_count", &self.failure_count)
            .field("is_stale", &self.is_stale)
            .field("is_placeholder_data", &self.is_placeholder_data)
            .finish_non_exhaustive()
    }
}

/// Read-instrumented view of a result: every accessor records its field in
/// the observer's tracked set.
pub struct TrackedResult<'a> {
    result: &'a QueryObserverResult,
    tracked: &'a Mutex<HashSet<ResultField>>,
}

impl TrackedResult<'_> {
    fn track(&self, field: ResultField) {
        self.tracked.lock().insert(field);
    }

    #[must_use]
    pub fn data(&self) -> Option<&SharedData> {
        self.track(ResultField::Data);
        self.result.data.as_ref()
    }

    #[must_use]
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.track(ResultField::Data);
        self.result.data_as::<T>()
    }

    #[must_use]
    pub fn error(&self) -> Option<&QueryError> {
        self.track(ResultField::Error);
        self.result.error.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.track(ResultField::Status);
        self.result.status
    }

    #[must_use]
    pub fn fetch_status(&self) -> FetchStatus {
        self.track(ResultField::FetchStatus);
        self.result.fetch_status
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.track(ResultField::IsPending);
        self.result.is_pending
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.track(ResultField::IsLoading);
        self.result.is_loading
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.track(ResultField::IsFetching);
        self.result.is_fetching
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.track(ResultField::IsPaused);
        self.result.is_paused
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.track(ResultField::IsSuccess);
        self.result.is_success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.track(ResultField::IsError);
        self.result.is_error
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.track(ResultField::IsStale);
        self.result.is_stale
    }

    #[must_use]
    pub fn is_placeholder_data(&self) -> bool {
        self.track(ResultField::IsPlaceholderData);
        self.result.is_placeholder_data
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.track(ResultField::FailureCount);
        self.result.failure_count
    }

    #[must_use]
    pub fn failure_reason(&self) -> Option<&QueryError> {
        self.track(ResultField::FailureReason);
        self.result.failure_reason.as_ref()
    }

    #[must_use]
    pub fn promise(&self) -> Option<&QueryPromise> {
        self.track(ResultField::Promise);
        self.result.promise.as_ref()
    }
}

struct SelectCache {
    select: SelectFn,
    input: SharedData,
    output: Result<SharedData, QueryError>,
}

/// One subscription to a query.
pub struct QueryObserver {
    client: QueryClient,
    options: Mutex<QueryOptions>,
    query: Mutex<Arc<Query>>,
    result: Mutex<QueryObserverResult>,
    listeners: ListenerSet<QueryObserverResult>,
    tracked: Mutex<HashSet<ResultField>>,
    select_cache: Mutex<Option<SelectCache>>,
    last_query_with_data: Mutex<Option<Arc<Query>>>,
    attached: Mutex<bool>,
    mount_counts: Mutex<(u64, u64)>,
    stale_timer: TaskSlot,
    interval_slot: TaskSlot,
    current_interval: Mutex<Option<std::time::Duration>>,
    watch_tx: watch::Sender<QueryObserverResult>,
}

impl QueryObserver {
    pub fn new(client: &QueryClient, options: QueryOptions) -> Result<Arc<Self>, QueryError> {
        let options = client.default_query_options(options);
        let query = client.build_query(&options)?;

        let placeholder = initial_result(&query);
        let (watch_tx, _watch_rx) = watch::channel(placeholder.clone());

        let observer = Arc::new(Self {
            client: client.clone(),
            options: Mutex::new(options.clone()),
            query: Mutex::new(query.clone()),
            result: Mutex::new(placeholder),
            listeners: ListenerSet::new(),
            tracked: Mutex::new(HashSet::new()),
            select_cache: Mutex::new(None),
            last_query_with_data: Mutex::new(None),
            attached: Mutex::new(false),
            mount_counts: Mutex::new((0, 0)),
            stale_timer: TaskSlot::new(),
            interval_slot: TaskSlot::new(),
            current_interval: Mutex::new(None),
            watch_tx,
        });

        let result = observer.create_result(&query, &options);
        *observer.result.lock() = result.clone();
        observer.watch_tx.send_replace(result);
        Ok(observer)
    }

    #[must_use]
    pub fn current_query(&self) -> Arc<Query> {
        self.query.lock().clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    #[must_use]
    pub fn current_result(&self) -> QueryObserverResult {
        self.result.lock().clone()
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Registers a result listener. The first listener attaches the
    /// observer to its query and applies the mount trigger policy.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.listeners.subscribe(listener);
        if self.listeners.len() == 1 {
            self.on_subscribe();
        }
        id
    }

    pub fn unsubscribe(self: &Arc<Self>, id: u64) -> bool {
        let removed = self.listeners.unsubscribe(id);
        if removed && self.listeners.is_empty() {
            self.detach();
        }
        removed
    }

    /// Detaches from the query without destroying the observer; the current
    /// result stays readable.
    pub fn destroy(self: &Arc<Self>) {
        self.detach();
    }

    /// The observer's results as a stream. The stream keeps the observer
    /// attached (and its triggers live) until dropped.
    #[must_use]
    pub fn stream(self: &Arc<Self>) -> ObserverResultStream {
        let listener_id = self.subscribe(|_| {});
        ObserverResultStream {
            inner: WatchStream::new(self.watch_tx.subscribe()),
            observer: self.clone(),
            listener_id,
        }
    }

    fn on_subscribe(self: &Arc<Self>) {
        if self.options.lock().subscribed == Some(false) {
            return;
        }
        self.attach();
    }

    fn attach(self: &Arc<Self>) {
        {
            let mut attached = self.attached.lock();
            if *attached {
                return;
            }
            *attached = true;
        }

        let query = self.current_query();
        {
            let state = query.state();
            *self.mount_counts.lock() = (state.data_update_count, state.error_update_count);
        }
        query.add_observer(self);

        let options = self.options();
        if should_fetch_on_mount(&query, &options) {
            let _ = self.execute_fetch(FetchOptions::default());
        } else {
            self.update_result();
        }
        self.update_timers();
    }

    fn detach(self: &Arc<Self>) {
        {
            let mut attached = self.attached.lock();
            if !*attached {
                return;
            }
            *attached = false;
        }
        self.stale_timer.abort();
        self.interval_slot.abort();
        *self.current_interval.lock() = None;
        self.current_query().remove_observer(self);
    }

    /// Applies new options: re-resolves defaults, swaps the underlying query
    /// when the key hash changed, applies the mount policy to enable
    /// transitions and key swaps, and recomputes timers and the result.
    pub fn set_options(self: &Arc<Self>, options: QueryOptions) {
        let options = self.client.default_query_options(options);
        let prev_options = {
            let mut slot = self.options.lock();
            std::mem::replace(&mut *slot, options.clone())
        };
        let prev_query = self.current_query();

        let next_query = match self.client.build_query(&options) {
            Ok(query) => query,
            Err(_) => prev_query.clone(),
        };
        let query_changed = !Arc::ptr_eq(&next_query, &prev_query);

        if query_changed {
            if prev_query.state().data.is_some() {
                *self.last_query_with_data.lock() = Some(prev_query.clone());
            }
            *self.query.lock() = next_query.clone();
            self.select_cache.lock().take();
        }

        let should_attach = self.has_listeners() && options.subscribed != Some(false);
        let was_attached = *self.attached.lock();

        if was_attached && (query_changed || !should_attach) {
            self.stale_timer.abort();
            self.interval_slot.abort();
            *self.current_interval.lock() = None;
            prev_query.remove_observer(self);
            *self.attached.lock() = false;
        }

        if should_attach && !*self.attached.lock() {
            *self.attached.lock() = true;
            {
                let state = next_query.state();
                *self.mount_counts.lock() = (state.data_update_count, state.error_update_count);
            }
            next_query.add_observer(self);
        }

        if *self.attached.lock() {
            let enabled_now = options.resolved_enabled(&next_query);
            let was_enabled = prev_options.resolved_enabled(&prev_query);
            // a key swap or an enabled false→true transition is a mount
            let mount_like = query_changed || (!was_enabled && enabled_now);
            if mount_like && should_fetch_on_mount(&next_query, &options) {
                let _ = self.execute_fetch(FetchOptions::default());
            }
        }

        self.update_result();
        if *self.attached.lock() {
            self.update_timers();
        }
    }

    /// Refetches and resolves with the settled result.
    pub async fn refetch(self: &Arc<Self>) -> QueryObserverResult {
        let promise = self.execute_fetch(FetchOptions::default());
        let _ = promise.await;
        self.current_result()
    }

    pub(crate) fn trigger_refetch(self: &Arc<Self>, fetch_options: FetchOptions) {
        let _ = self.execute_fetch(fetch_options);
    }

    fn execute_fetch(self: &Arc<Self>, fetch_options: FetchOptions) -> QueryPromise {
        let query = self.current_query();
        let options = self.options();
        query.fetch(Some(&options), fetch_options)
    }

    /// The result a binding may assume before subscribing: the current
    /// derivation, with the fetch the mount policy is about to start already
    /// reflected.
    #[must_use]
    pub fn get_optimistic_result(self: &Arc<Self>, options: QueryOptions) -> QueryObserverResult {
        let options = self.client.default_query_options(options);
        let query = match self.client.build_query(&options) {
            Ok(query) => query,
            Err(_) => self.current_query(),
        };
        let mut result = self.create_result(&query, &options);
        if should_fetch_on_mount(&query, &options) {
            result.fetch_status = FetchStatus::Fetching;
            result.is_fetching = true;
            result.is_loading = result.is_pending;
            result.is_refetching = !result.is_pending;
        }
        result
    }

    /// Wraps a result so field reads register in the tracked set.
    #[must_use]
    pub fn track_result<'a>(&'a self, result: &'a QueryObserverResult) -> TrackedResult<'a> {
        TrackedResult {
            result,
            tracked: &self.tracked,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        let query = self.current_query();
        self.options().resolved_enabled(&query)
    }

    pub(crate) fn current_result_is_stale(&self) -> bool {
        self.result.lock().is_stale
    }

    pub(crate) fn should_fetch_on_window_focus(&self) -> bool {
        if !*self.attached.lock() {
            return false;
        }
        let query = self.current_query();
        let options = self.options();
        should_fetch_on(
            &query,
            &options,
            options.refetch_on_window_focus.unwrap_or_default(),
        )
    }

    pub(crate) fn should_fetch_on_reconnect(&self) -> bool {
        if !*self.attached.lock() {
            return false;
        }
        let query = self.current_query();
        let options = self.options();
        should_fetch_on(
            &query,
            &options,
            options.refetch_on_reconnect.unwrap_or_default(),
        )
    }

    /// Reacts to a query state transition: recompute the result and, when a
    /// field the consumer cares about changed, notify listeners within the
    /// current batch.
    pub(crate) fn on_query_update(self: &Arc<Self>) {
        self.update_result();
        if *self.attached.lock() {
            self.update_timers();
        }
    }

    fn update_result(self: &Arc<Self>) {
        let query = self.current_query();
        let options = self.options();
        let next = self.create_result(&query, &options);

        if query.state().data.is_some() {
            *self.last_query_with_data.lock() = Some(query.clone());
        }

        let previous = {
            let mut slot = self.result.lock();
            std::mem::replace(&mut *slot, next.clone())
        };
        self.watch_tx.send_replace(next.clone());

        let changed = changed_fields(&previous, &next);
        if changed.is_empty() || !self.should_notify(&changed, &options) {
            return;
        }

        let observer = self.clone();
        let result = next;
        self.client.notify_manager().schedule(move || {
            observer.listeners.emit(&result);
        });
        self.client
            .query_cache()
            .notify(QueryCacheEvent::ObserverResultsUpdated { query });
    }

    fn should_notify(&self, changed: &HashSet<ResultField>, options: &QueryOptions) -> bool {
        match &options.notify_on_change_props {
            Some(NotifyOnChangeProps::All) => true,
            Some(NotifyOnChangeProps::Props(props)) => {
                props.iter().any(|field| changed.contains(field))
            }
            Some(NotifyOnChangeProps::Compute(compute)) => {
                compute().iter().any(|field| changed.contains(field))
            }
            None => {
                let tracked = self.tracked.lock();
                if tracked.is_empty() {
                    true
                } else {
                    changed.iter().any(|field| tracked.contains(field))
                }
            }
        }
    }

    fn create_result(self: &Arc<Self>, query: &Arc<Query>, options: &QueryOptions) -> QueryObserverResult {
        let state = query.state();
        let mut data = state.data.clone();
        let mut status = state.status;
        let mut error = state.error.clone();
        let mut select_error = None;
        let mut is_placeholder = false;

        if let (Some(select), Some(raw)) = (&options.select, &state.data) {
            match self.memoized_select(select, raw) {
                Ok(selected) => data = Some(selected),
                Err(failure) => select_error = Some(failure),
            }
        }

        if data.is_none() && status == QueryStatus::Pending && options.placeholder_data.is_some() {
            let previous_query = self.last_query_with_data.lock().clone();
            let previous_data = previous_query.as_ref().and_then(|q| q.state().data);
            let placeholder = match options.placeholder_data.as_ref() {
                Some(PlaceholderData::Value(value)) => Some(value.clone()),
                Some(PlaceholderData::KeepPrevious) => previous_data,
                Some(PlaceholderData::Compute(compute)) => {
                    compute(previous_data, previous_query.as_ref())
                }
                None => None,
            };

            if let Some(placeholder) = placeholder {
                let presented = match &options.select {
                    Some(select) => match self.memoized_select(select, &placeholder) {
                        Ok(selected) => Some(selected),
                        Err(failure) => {
                            select_error = Some(failure);
                            None
                        }
                    },
                    None => Some(placeholder),
                };
                if let Some(presented) = presented {
                    status = QueryStatus::Success;
                    data = Some(presented);
                    is_placeholder = true;
                }
            }
        }

        if let Some(failure) = select_error {
            error = Some(failure);
            status = QueryStatus::Error;
        }

        let fetch_status = state.fetch_status;
        let is_pending = status == QueryStatus::Pending;
        let is_error = status == QueryStatus::Error;
        let is_fetching = fetch_status == FetchStatus::Fetching;
        let (mount_data_count, mount_error_count) = *self.mount_counts.lock();

        let should_throw = match (&error, &options.throw_on_error) {
            (Some(error), Some(throw_on_error)) if is_error => {
                throw_on_error.resolve(error, query)
            }
            _ => false,
        };

        QueryObserverResult {
            data,
            data_updated_at: state.data_updated_at,
            error,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            status,
            fetch_status,
            is_pending,
            is_loading: is_pending && is_fetching,
            is_fetching,
            is_paused: fetch_status == FetchStatus::Paused,
            is_success: status == QueryStatus::Success,
            is_error,
            is_loading_error: is_error && state.data_updated_at.is_none(),
            is_refetch_error: is_error && state.data_updated_at.is_some(),
            is_refetching: is_fetching && !is_pending,
            is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
            is_fetched_after_mount: state.data_update_count > mount_data_count
                || state.error_update_count > mount_error_count,
            is_stale: is_stale_for(query, options),
            is_placeholder_data: is_placeholder,
            should_throw,
            promise: query.promise(),
            refetch: Refetch {
                observer: Arc::downgrade(self),
            },
        }
    }

    fn memoized_select(
        &self,
        select: &SelectFn,
        input: &SharedData,
    ) -> Result<SharedData, QueryError> {
        let mut cache = self.select_cache.lock();
        if let Some(entry) = cache.as_ref() {
            if Arc::ptr_eq(&entry.select, select) && Arc::ptr_eq(&entry.input, input) {
                return entry.output.clone();
            }
        }
        let output = select(input);
        *cache = Some(SelectCache {
            select: select.clone(),
            input: input.clone(),
            output: output.clone(),
        });
        output
    }

    fn update_timers(self: &Arc<Self>) {
        self.update_stale_timeout();
        self.update_refetch_interval();
    }

    /// Arms a timer that flips the result to stale (and notifies) once the
    /// stale window elapses.
    fn update_stale_timeout(self: &Arc<Self>) {
        let query = self.current_query();
        let options = self.options();

        let StaleTime::After(window) = options.resolved_stale_time(&query) else {
            self.stale_timer.abort();
            return;
        };
        if self.result.lock().is_stale {
            self.stale_timer.abort();
            return;
        }
        let Some(updated_at) = query.state().data_updated_at else {
            self.stale_timer.abort();
            return;
        };

        let deadline = updated_at + window + std::time::Duration::from_millis(1);
        let weak = Arc::downgrade(self);
        self.stale_timer.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(observer) = weak.upgrade() {
                observer.update_result();
            }
        });
    }

    fn update_refetch_interval(self: &Arc<Self>) {
        let query = self.current_query();
        let options = self.options();

        let next = if options.is_skip() || !options.resolved_enabled(&query) {
            None
        } else {
            options
                .refetch_interval
                .as_ref()
                .and_then(|interval| interval.resolve(&query))
        };

        {
            let mut current = self.current_interval.lock();
            if *current == next {
                return;
            }
            *current = next;
        }

        match next {
            None => self.interval_slot.abort(),
            Some(interval) => {
                let weak = Arc::downgrade(self);
                self.interval_slot.spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        let Some(observer) = weak.upgrade() else {
                            break;
                        };
                        observer.on_interval_tick();
                    }
                });
            }
        }
    }

    fn on_interval_tick(self: &Arc<Self>) {
        if !*self.attached.lock() {
            return;
        }
        let options = self.options();
        let in_background = options.refetch_interval_in_background.unwrap_or(false);
        if !in_background && !self.client.focus_manager().is_focused() {
            return;
        }
        let query = self.current_query();
        if options.is_skip() || !options.resolved_enabled(&query) {
            return;
        }
        self.trigger_refetch(FetchOptions::default());
    }
}

/// The mount policy: load when there is nothing yet, refetch per
/// `refetch_on_mount` when there is.
fn should_fetch_on_mount(query: &Arc<Query>, options: &QueryOptions) -> bool {
    if options.is_skip() {
        return false;
    }
    let state = query.state();
    let enabled = options.resolved_enabled(query);

    let should_load = enabled
        && state.data.is_none()
        && !(state.status == QueryStatus::Error && options.retry_on_mount == Some(false));
    if should_load {
        return true;
    }

    state.data.is_some()
        && should_fetch_on(query, options, options.refetch_on_mount.unwrap_or_default())
}

/// The event policy shared by focus/reconnect/mount refetches: `Always`
/// ignores staleness, `IfStale` requires it, static queries never refetch.
fn should_fetch_on(query: &Arc<Query>, options: &QueryOptions, policy: RefetchOn) -> bool {
    if options.is_skip() || !options.resolved_enabled(query) {
        return false;
    }
    if options.resolved_stale_time(query).is_static() {
        return false;
    }
    match policy {
        RefetchOn::Never => false,
        RefetchOn::Always => true,
        RefetchOn::IfStale => is_stale_for(query, options),
    }
}

fn is_stale_for(query: &Arc<Query>, options: &QueryOptions) -> bool {
    options.resolved_enabled(query) && query.is_stale_by_time(&options.resolved_stale_time(query))
}

fn initial_result(query: &Arc<Query>) -> QueryObserverResult {
    let state = query.state();
    let is_pending = state.status == QueryStatus::Pending;
    QueryObserverResult {
        data: state.data.clone(),
        data_updated_at: state.data_updated_at,
        error: None,
        error_updated_at: None,
        failure_count: 0,
        failure_reason: None,
        status: state.status,
        fetch_status: state.fetch_status,
        is_pending,
        is_loading: false,
        is_fetching: false,
        is_paused: false,
        is_success: state.status == QueryStatus::Success,
        is_error: false,
        is_loading_error: false,
        is_refetch_error: false,
        is_refetching: false,
        is_fetched: false,
        is_fetched_after_mount: false,
        is_stale: true,
        is_placeholder_data: false,
        should_throw: false,
        promise: None,
        refetch: Refetch {
            observer: Weak::new(),
        },
    }
}

fn same_data(a: &Option<SharedData>, b: &Option<SharedData>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn same_promise(a: &Option<QueryPromise>, b: &Option<QueryPromise>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.ptr_eq(b),
        _ => false,
    }
}

fn changed_fields(a: &QueryObserverResult, b: &QueryObserverResult) -> HashSet<ResultField> {
    let mut changed = HashSet::new();
    if !same_data(&a.data, &b.data) {
        changed.insert(ResultField::Data);
    }
    if a.data_updated_at != b.data_updated_at {
        changed.insert(ResultField::DataUpdatedAt);
    }
    if a.error != b.error {
        changed.insert(ResultField::Error);
    }
    if a.error_updated_at != b.error_updated_at {
        changed.insert(ResultField::ErrorUpdatedAt);
    }
    if a.failure_count != b.failure_count {
        changed.insert(ResultField::FailureCount);
    }
    if a.failure_reason != b.failure_reason {
        changed.insert(ResultField::FailureReason);
    }
    if a.status != b.status {
        changed.insert(ResultField::Status);
        changed.insert(ResultField::IsPending);
        changed.insert(ResultField::IsSuccess);
        changed.insert(ResultField::IsError);
    }
    if a.fetch_status != b.fetch_status {
        changed.insert(ResultField::FetchStatus);
        changed.insert(ResultField::IsFetching);
        changed.insert(ResultField::IsPaused);
    }
    if a.is_loading != b.is_loading {
        changed.insert(ResultField::IsLoading);
    }
    if a.is_stale != b.is_stale {
        changed.insert(ResultField::IsStale);
    }
    if a.is_placeholder_data != b.is_placeholder_data {
        changed.insert(ResultField::IsPlaceholderData);
    }
    if !same_promise(&a.promise, &b.promise) {
        changed.insert(ResultField::Promise);
    }
    changed
}

/// Stream adapter over an observer's results.
pub struct ObserverResultStream {
    inner: WatchStream<QueryObserverResult>,
    observer: Arc<QueryObserver>,
    listener_id: u64,
}

impl Stream for ObserverResultStream {
    type Item = QueryObserverResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ObserverResultStream {
    fn drop(&mut self) {
        self.observer.unsubscribe(self.listener_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> QueryObserverResult {
        QueryObserverResult {
            data: None,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            failure_count: 0,
            failure_reason: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            is_pending: true,
            is_loading: false,
            is_fetching: false,
            is_paused: false,
            is_success: false,
            is_error: false,
            is_loading_error: false,
            is_refetch_error: false,
            is_refetching: false,
            is_fetched: false,
            is_fetched_after_mount: false,
            is_stale: true,
            is_placeholder_data: false,
            should_throw: false,
            promise: None,
            refetch: Refetch {
                observer: Weak::new(),
            },
        }
    }

    #[test]
    fn test_changed_fields_detects_data_identity() {
        let a = sample_result();
        let mut b = sample_result();
        assert!(changed_fields(&a, &b).is_empty());

        b.data = Some(crate::sharing::shared(1u32));
        let changed = changed_fields(&a, &b);
        assert!(changed.contains(&ResultField::Data));
        assert!(!changed.contains(&ResultField::Status));
    }

    #[test]
    fn test_changed_fields_maps_status_flags() {
        let a = sample_result();
        let mut b = sample_result();
        b.status = QueryStatus::Success;
        b.is_pending = false;
        b.is_success = true;

        let changed = changed_fields(&a, &b);
        assert!(changed.contains(&ResultField::Status));
        assert!(changed.contains(&ResultField::IsPending));
        assert!(changed.contains(&ResultField::IsSuccess));
    }

    #[test]
    fn test_tracked_result_records_reads() {
        let result = sample_result();
        let tracked = Mutex::new(HashSet::new());
        let view = TrackedResult {
            result: &result,
            tracked: &tracked,
        };

        let _ = view.data();
        let _ = view.is_stale();

        let recorded = tracked.lock();
        assert!(recorded.contains(&ResultField::Data));
        assert!(recorded.contains(&ResultField::IsStale));
        assert!(!recorded.contains(&ResultField::Error));
    }
}
