//! Query and mutation configuration.
//!
//! Options are structs of optional fields so they can be layered: client
//! defaults, key-matched defaults and per-observer options merge by filling
//! whatever is unset, and resolution helpers supply the hard defaults for the
//! rest. Builders wrap typed user closures into the type-erased forms the
//! engine stores.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::gc::GcTime;
use crate::infinite::GetPageParam;
use crate::key::{QueryKey, QueryKeyHashFn, hash_query_key_with};
use crate::query::{FetchBehavior, Query};
use crate::query_observer::ResultField;
use crate::retry::{AbortSignal, NetworkMode, RetryDelay, RetryPolicy};
use crate::sharing::{ReplaceEqual, SharedData, StructuralSharing, downcast, shared};

/// Arbitrary metadata attached to queries and mutations, passed through to
/// query functions and lifecycle hooks.
pub type QueryMeta = serde_json::Map<String, serde_json::Value>;

/// Context handed to every query function invocation.
#[derive(Clone)]
pub struct QueryFnContext {
    query_key: QueryKey,
    meta: Option<QueryMeta>,
    page_param: Option<SharedData>,
    signal: AbortSignal,
}

impl QueryFnContext {
    pub(crate) fn new(
        query_key: QueryKey,
        meta: Option<QueryMeta>,
        page_param: Option<SharedData>,
        signal: AbortSignal,
    ) -> Self {
        Self {
            query_key,
            meta,
            page_param,
            signal,
        }
    }

    #[must_use]
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    #[must_use]
    pub fn meta(&self) -> Option<&QueryMeta> {
        self.meta.as_ref()
    }

    /// The page parameter for the current page fetch of an infinite query.
    #[must_use]
    pub fn page_param(&self) -> Option<&SharedData> {
        self.page_param.as_ref()
    }

    #[must_use]
    pub fn page_param_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.page_param.as_ref().and_then(downcast::<T>)
    }

    /// The cancellation token for this fetch. Taking it marks the fetch as
    /// abort-aware: once consumed, the fetch is cancelled when its last
    /// observer unsubscribes instead of running to completion.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        self.signal.mark_consumed();
        self.signal.clone()
    }
}

type QueryFnInner =
    Arc<dyn Fn(QueryFnContext) -> BoxFuture<'static, Result<SharedData, QueryError>> + Send + Sync>;

/// The fetching function of a query, or the sentinel that disables fetching
/// while keeping the query registered.
#[derive(Clone)]
pub enum QueryFn {
    Run(QueryFnInner),
    Skip,
}

impl QueryFn {
    pub(crate) fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// Sentinel `query_fn` value: the query stays registered but never fetches.
#[must_use]
pub fn skip_token() -> QueryFn {
    QueryFn::Skip
}

/// When data is considered stale and eligible for automatic refetching.
#[derive(Clone)]
pub enum StaleTime {
    After(Duration),
    /// Never stale, never auto-refetched, immune to invalidation sweeps.
    Static,
    Compute(Arc<dyn Fn(&Query) -> StaleTime + Send + Sync>),
}

impl StaleTime {
    pub(crate) fn resolve(&self, query: &Query) -> StaleTime {
        match self {
            Self::Compute(compute) => match compute(query) {
                Self::Compute(_) => Self::After(Duration::ZERO),
                resolved => resolved,
            },
            other => other.clone(),
        }
    }

    pub(crate) fn is_static(&self) -> bool {
        matches!(self, Self::Static)
    }
}

impl From<Duration> for StaleTime {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl std::fmt::Debug for StaleTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::After(duration) => write!(f, "StaleTime::After({duration:?})"),
            Self::Static => f.write_str("StaleTime::Static"),
            Self::Compute(_) => f.write_str("StaleTime::Compute"),
        }
    }
}

/// Whether an observer participates in automatic fetching.
#[derive(Clone)]
pub enum Enabled {
    Set(bool),
    Compute(Arc<dyn Fn(&Query) -> bool + Send + Sync>),
}

impl Enabled {
    pub(crate) fn resolve(&self, query: &Query) -> bool {
        match self {
            Self::Set(enabled) => *enabled,
            Self::Compute(compute) => compute(query),
        }
    }
}

impl From<bool> for Enabled {
    fn from(enabled: bool) -> Self {
        Self::Set(enabled)
    }
}

/// Refetch trigger policy for mount, focus, and reconnect events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchOn {
    Never,
    /// Refetch only when the data is stale.
    #[default]
    IfStale,
    /// Refetch regardless of staleness.
    Always,
}

impl From<bool> for RefetchOn {
    fn from(refetch: bool) -> Self {
        if refetch { Self::IfStale } else { Self::Never }
    }
}

/// Periodic refetching while an observer is subscribed.
#[derive(Clone)]
pub enum RefetchInterval {
    Every(Duration),
    Compute(Arc<dyn Fn(&Query) -> Option<Duration> + Send + Sync>),
}

impl RefetchInterval {
    pub(crate) fn resolve(&self, query: &Query) -> Option<Duration> {
        match self {
            Self::Every(interval) => Some(*interval),
            Self::Compute(compute) => compute(query),
        }
    }
}

impl From<Duration> for RefetchInterval {
    fn from(interval: Duration) -> Self {
        Self::Every(interval)
    }
}

/// Data shown by an observer while its query has none.
///
/// Placeholder data is observer-local: it is never written into the cache.
#[derive(Clone)]
pub enum PlaceholderData {
    Value(SharedData),
    /// Present the previous query's data while the new key loads.
    KeepPrevious,
    Compute(Arc<dyn Fn(Option<SharedData>, Option<&Arc<Query>>) -> Option<SharedData> + Send + Sync>),
}

/// The standard placeholder helper: keep showing the previous data.
#[must_use]
pub fn keep_previous_data() -> PlaceholderData {
    PlaceholderData::KeepPrevious
}

/// Data baked into a query's initial state (unlike placeholder data, this is
/// real cache data).
#[derive(Clone)]
pub enum InitialData {
    Value(SharedData),
    Compute(Arc<dyn Fn() -> Option<SharedData> + Send + Sync>),
}

impl InitialData {
    pub(crate) fn resolve(&self) -> Option<SharedData> {
        match self {
            Self::Value(data) => Some(data.clone()),
            Self::Compute(compute) => compute(),
        }
    }
}

/// Overrides tracked-property notification suppression.
#[derive(Clone)]
pub enum NotifyOnChangeProps {
    /// Notify on any result change.
    All,
    Props(Vec<ResultField>),
    Compute(Arc<dyn Fn() -> Vec<ResultField> + Send + Sync>),
}

/// Whether a subscriber should re-throw the error from its rendered result.
#[derive(Clone)]
pub enum ThrowOnError {
    Set(bool),
    Compute(Arc<dyn Fn(&QueryError, &Query) -> bool + Send + Sync>),
}

impl ThrowOnError {
    pub(crate) fn resolve(&self, error: &QueryError, query: &Query) -> bool {
        match self {
            Self::Set(throw) => *throw,
            Self::Compute(compute) => compute(error, query),
        }
    }
}

impl From<bool> for ThrowOnError {
    fn from(throw: bool) -> Self {
        Self::Set(throw)
    }
}

/// Pure transform from raw query data to the data presented on results.
pub type SelectFn = Arc<dyn Fn(&SharedData) -> Result<SharedData, QueryError> + Send + Sync>;

/// Options for one query, in layered (partially set) form.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub query_key: Option<QueryKey>,
    pub query_hash: Option<String>,
    pub query_key_hash_fn: Option<QueryKeyHashFn>,
    pub query_fn: Option<QueryFn>,
    pub stale_time: Option<StaleTime>,
    pub gc_time: Option<GcTime>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub enabled: Option<Enabled>,
    pub refetch_on_mount: Option<RefetchOn>,
    pub refetch_on_window_focus: Option<RefetchOn>,
    pub refetch_on_reconnect: Option<RefetchOn>,
    pub refetch_interval: Option<RefetchInterval>,
    pub refetch_interval_in_background: Option<bool>,
    pub retry_on_mount: Option<bool>,
    pub select: Option<SelectFn>,
    pub structural_sharing: Option<StructuralSharing>,
    pub placeholder_data: Option<PlaceholderData>,
    pub initial_data: Option<InitialData>,
    pub initial_data_updated_at: Option<Instant>,
    pub meta: Option<QueryMeta>,
    pub throw_on_error: Option<ThrowOnError>,
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
    pub subscribed: Option<bool>,
    pub behavior: Option<Arc<dyn FetchBehavior>>,
    pub initial_page_param: Option<SharedData>,
    pub get_next_page_param: Option<GetPageParam>,
    pub get_previous_page_param: Option<GetPageParam>,
    pub max_pages: Option<usize>,
    pub pages: Option<usize>,
}

impl QueryOptions {
    #[must_use]
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            ..Self::default()
        }
    }

    /// Sets a typed query function. Unless configured otherwise, results
    /// merge with their predecessor via
    /// [`StructuralSharing::replace_equal`], so unchanged parts (an equal
    /// whole, or equal elements of a vector) keep their previous identity.
    #[must_use]
    pub fn query_fn<T, F, Fut>(mut self, f: F) -> Self
    where
        T: ReplaceEqual,
        F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        if self.structural_sharing.is_none() {
            self.structural_sharing = Some(StructuralSharing::replace_equal::<T>());
        }
        self.query_fn = Some(QueryFn::Run(Arc::new(move |ctx| {
            let fut = f(ctx);
            async move { fut.await.map(shared) }.boxed()
        })));
        self
    }

    /// Sets an already type-erased query function (or [`skip_token`]).
    #[must_use]
    pub fn query_fn_erased(mut self, query_fn: QueryFn) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
        self.stale_time = Some(stale_time.into());
        self
    }

    #[must_use]
    pub fn gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.gc_time = Some(gc_time.into());
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    #[must_use]
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: impl Into<Enabled>) -> Self {
        self.enabled = Some(enabled.into());
        self
    }

    #[must_use]
    pub fn refetch_on_mount(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.refetch_on_mount = Some(refetch.into());
        self
    }

    #[must_use]
    pub fn refetch_on_window_focus(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.refetch_on_window_focus = Some(refetch.into());
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.refetch_on_reconnect = Some(refetch.into());
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: impl Into<RefetchInterval>) -> Self {
        self.refetch_interval = Some(interval.into());
        self
    }

    #[must_use]
    pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.refetch_interval_in_background = Some(in_background);
        self
    }

    /// Pure transform applied to raw data before it reaches results. The
    /// transform is memoised on the select identity and the raw data
    /// identity.
    #[must_use]
    pub fn select<T, U>(self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
    {
        self.try_select(move |data: &T| Ok(f(data)))
    }

    /// Fallible variant of [`QueryOptions::select`]; the error surfaces on
    /// the observer result without touching query state.
    #[must_use]
    pub fn try_select<T, U>(mut self, f: impl Fn(&T) -> Result<U, QueryError> + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
    {
        self.select = Some(Arc::new(move |data| match downcast::<T>(data) {
            Some(input) => f(&input).map(shared),
            None => Err(QueryError::message("select input type mismatch")),
        }));
        self
    }

    #[must_use]
    pub fn structural_sharing(mut self, sharing: StructuralSharing) -> Self {
        self.structural_sharing = Some(sharing);
        self
    }

    #[must_use]
    pub fn placeholder_data(mut self, placeholder: PlaceholderData) -> Self {
        self.placeholder_data = Some(placeholder);
        self
    }

    #[must_use]
    pub fn initial_data<T: Send + Sync + 'static>(mut self, data: T) -> Self {
        self.initial_data = Some(InitialData::Value(shared(data)));
        self
    }

    #[must_use]
    pub fn initial_data_updated_at(mut self, updated_at: Instant) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: QueryMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn throw_on_error(mut self, throw: impl Into<ThrowOnError>) -> Self {
        self.throw_on_error = Some(throw.into());
        self
    }

    #[must_use]
    pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    #[must_use]
    pub fn subscribed(mut self, subscribed: bool) -> Self {
        self.subscribed = Some(subscribed);
        self
    }

    /// Fills unset fields from `defaults`.
    #[must_use]
    pub(crate) fn or_defaults(mut self, defaults: &QueryOptions) -> QueryOptions {
        macro_rules! inherit {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field.is_none() {
                        self.$field = defaults.$field.clone();
                    }
                )*
            };
        }
        inherit!(
            query_key,
            query_hash,
            query_key_hash_fn,
            query_fn,
            stale_time,
            gc_time,
            retry,
            retry_delay,
            network_mode,
            enabled,
            refetch_on_mount,
            refetch_on_window_focus,
            refetch_on_reconnect,
            refetch_interval,
            refetch_interval_in_background,
            retry_on_mount,
            select,
            structural_sharing,
            placeholder_data,
            initial_data,
            initial_data_updated_at,
            meta,
            throw_on_error,
            notify_on_change_props,
            subscribed,
            behavior,
            initial_page_param,
            get_next_page_param,
            get_previous_page_param,
            max_pages,
            pages,
        );
        self
    }

    /// The canonical hash for this option set's key, honouring a custom hash
    /// function.
    #[must_use]
    pub(crate) fn hash_key(&self) -> Option<String> {
        self.query_key
            .as_ref()
            .map(|key| hash_query_key_with(key, self.query_key_hash_fn.as_ref()))
    }

    pub(crate) fn resolved_stale_time(&self, query: &Query) -> StaleTime {
        self.stale_time
            .as_ref()
            .map_or(StaleTime::After(Duration::ZERO), |stale_time| {
                stale_time.resolve(query)
            })
    }

    pub(crate) fn resolved_enabled(&self, query: &Query) -> bool {
        self.enabled
            .as_ref()
            .is_none_or(|enabled| enabled.resolve(query))
    }

    pub(crate) fn resolved_gc_time(&self) -> GcTime {
        self.gc_time.unwrap_or(GcTime::DEFAULT)
    }

    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    pub(crate) fn resolved_structural_sharing(&self) -> StructuralSharing {
        self.structural_sharing
            .clone()
            .unwrap_or(StructuralSharing::Disabled)
    }

    pub(crate) fn is_skip(&self) -> bool {
        self.query_fn.as_ref().is_some_and(QueryFn::is_skip)
    }
}

/// Serialization lane for mutations: within one scope id, mutations run one
/// at a time in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationScope {
    pub id: String,
}

pub type MutationFn =
    Arc<dyn Fn(SharedData) -> BoxFuture<'static, Result<SharedData, QueryError>> + Send + Sync>;

pub type OnMutateFn = Arc<
    dyn Fn(SharedData) -> BoxFuture<'static, Result<Option<SharedData>, QueryError>> + Send + Sync,
>;

pub type OnMutationSuccessFn = Arc<
    dyn Fn(SharedData, SharedData, Option<SharedData>) -> BoxFuture<'static, Result<(), QueryError>>
        + Send
        + Sync,
>;

pub type OnMutationErrorFn = Arc<
    dyn Fn(QueryError, SharedData, Option<SharedData>) -> BoxFuture<'static, Result<(), QueryError>>
        + Send
        + Sync,
>;

pub type OnMutationSettledFn = Arc<
    dyn Fn(
            Option<SharedData>,
            Option<QueryError>,
            SharedData,
            Option<SharedData>,
        ) -> BoxFuture<'static, Result<(), QueryError>>
        + Send
        + Sync,
>;

/// Options for one mutation, in layered (partially set) form.
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub mutation_fn: Option<MutationFn>,
    pub mutation_key: Option<QueryKey>,
    pub on_mutate: Option<OnMutateFn>,
    pub on_success: Option<OnMutationSuccessFn>,
    pub on_error: Option<OnMutationErrorFn>,
    pub on_settled: Option<OnMutationSettledFn>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub scope: Option<MutationScope>,
    pub gc_time: Option<GcTime>,
    pub meta: Option<QueryMeta>,
}

impl MutationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a typed mutation function taking the mutate variables.
    #[must_use]
    pub fn mutation_fn<V, T, F, Fut>(mut self, f: F) -> Self
    where
        V: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(Arc<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        self.mutation_fn = Some(Arc::new(move |variables| match downcast::<V>(&variables) {
            Some(variables) => {
                let fut = f(variables);
                async move { fut.await.map(shared) }.boxed()
            }
            None => {
                async { Err(QueryError::message("mutation variables type mismatch")) }.boxed()
            }
        }));
        self
    }

    #[must_use]
    pub fn mutation_key(mut self, key: QueryKey) -> Self {
        self.mutation_key = Some(key);
        self
    }

    #[must_use]
    pub fn on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SharedData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<SharedData>, QueryError>> + Send + 'static,
    {
        self.on_mutate = Some(Arc::new(move |variables| f(variables).boxed()));
        self
    }

    #[must_use]
    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SharedData, SharedData, Option<SharedData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, variables, context| {
            f(data, variables, context).boxed()
        }));
        self
    }

    #[must_use]
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryError, SharedData, Option<SharedData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |error, variables, context| {
            f(error, variables, context).boxed()
        }));
        self
    }

    #[must_use]
    pub fn on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<SharedData>, Option<QueryError>, SharedData, Option<SharedData>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_settled = Some(Arc::new(move |data, error, variables, context| {
            f(data, error, variables, context).boxed()
        }));
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    #[must_use]
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub fn scope(mut self, id: impl Into<String>) -> Self {
        self.scope = Some(MutationScope { id: id.into() });
        self
    }

    #[must_use]
    pub fn gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.gc_time = Some(gc_time.into());
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: QueryMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Fills unset fields from `defaults`.
    #[must_use]
    pub(crate) fn or_defaults(mut self, defaults: &MutationOptions) -> MutationOptions {
        macro_rules! inherit {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field.is_none() {
                        self.$field = defaults.$field.clone();
                    }
                )*
            };
        }
        inherit!(
            mutation_fn,
            mutation_key,
            on_mutate,
            on_success,
            on_error,
            on_settled,
            retry,
            retry_delay,
            network_mode,
            scope,
            gc_time,
            meta,
        );
        self
    }

    /// Mutations do not retry unless asked to.
    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Count(0))
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    pub(crate) fn resolved_gc_time(&self) -> GcTime {
        self.gc_time.unwrap_or(GcTime::DEFAULT)
    }
}

/// Client-wide defaults applied beneath key-matched and per-observer
/// options.
#[derive(Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryOptions,
    pub mutations: MutationOptions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_or_defaults_keeps_explicit_values() {
        let options = QueryOptions::new(json!(["todos"]))
            .retry(5u32)
            .network_mode(NetworkMode::Always);
        let defaults = QueryOptions::default()
            .retry(1u32)
            .gc_time(Duration::from_secs(60));

        let merged = options.or_defaults(&defaults);
        assert!(matches!(merged.retry, Some(RetryPolicy::Count(5))));
        assert_eq!(merged.network_mode, Some(NetworkMode::Always));
        assert_eq!(merged.gc_time, Some(GcTime::After(Duration::from_secs(60))));
    }

    #[test]
    fn test_hash_key_uses_custom_hash_fn() {
        let mut options = QueryOptions::new(json!(["todos"]));
        assert_eq!(options.hash_key().as_deref(), Some("[\"todos\"]"));

        options.query_key_hash_fn = Some(Arc::new(|_| "custom".into()));
        assert_eq!(options.hash_key().as_deref(), Some("custom"));
    }

    #[test]
    fn test_query_fn_installs_structural_sharing() {
        let options =
            QueryOptions::new(json!(["n"])).query_fn(|_ctx| async move { Ok(1u32) });
        assert!(options.structural_sharing.is_some());
        assert!(options.query_fn.is_some());
    }

    #[test]
    fn test_skip_token_detection() {
        let options = QueryOptions::new(json!(["n"])).query_fn_erased(skip_token());
        assert!(options.is_skip());

        let options = QueryOptions::new(json!(["n"])).query_fn(|_ctx| async move { Ok(1u32) });
        assert!(!options.is_skip());
    }

    #[test]
    fn test_refetch_on_from_bool() {
        assert_eq!(RefetchOn::from(true), RefetchOn::IfStale);
        assert_eq!(RefetchOn::from(false), RefetchOn::Never);
    }

    #[test]
    fn test_mutation_defaults() {
        let options = MutationOptions::new();
        assert!(matches!(options.resolved_retry(), RetryPolicy::Count(0)));
        assert_eq!(options.resolved_network_mode(), NetworkMode::Online);
        assert_eq!(options.resolved_gc_time(), GcTime::DEFAULT);
    }

    #[test]
    fn test_mutation_or_defaults() {
        let defaults = MutationOptions::new().scope("lane").retry(2u32);
        let merged = MutationOptions::new().retry(0u32).or_defaults(&defaults);
        assert!(matches!(merged.retry, Some(RetryPolicy::Count(0))));
        assert_eq!(
            merged.scope,
            Some(MutationScope {
                id: "lane".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_typed_query_fn_wraps_output() {
        let options = QueryOptions::new(json!(["n"])).query_fn(|_ctx| async move { Ok(7u32) });
        let Some(QueryFn::Run(query_fn)) = options.query_fn else {
            panic!("query fn set");
        };

        let ctx = QueryFnContext::new(json!(["n"]), None, None, AbortSignal::new());
        let data = query_fn(ctx).await.expect("query fn succeeds");
        assert_eq!(downcast::<u32>(&data).as_deref(), Some(&7));
    }

    #[tokio::test]
    async fn test_typed_mutation_fn_checks_variables() {
        let options = MutationOptions::new()
            .mutation_fn(|variables: Arc<String>| async move { Ok(format!("did {variables}")) });
        let mutation_fn = options.mutation_fn.expect("mutation fn set");

        let ok = mutation_fn(shared("x".to_string())).await.expect("runs");
        assert_eq!(downcast::<String>(&ok).as_deref().map(String::as_str), Some("did x"));

        let err = mutation_fn(shared(42u32)).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_signal_consumption_marks_context() {
        let signal = AbortSignal::new();
        let ctx = QueryFnContext::new(json!(["n"]), None, None, signal.clone());
        assert!(!signal.is_consumed());
        let _taken = ctx.signal();
        assert!(signal.is_consumed());
    }
}
