//! The client facade.
//!
//! Composes a query cache and a mutation cache, resolves option defaults
//! (client-wide, then key-matched, then per-call), and exposes the
//! imperative command surface: fetching, prefetching, direct cache reads and
//! writes, invalidation, refetch sweeps, cancellation and reset. Mounting a
//! client wires the ambient focus/online signals into the caches; paused
//! mutations always resume before the reconnect refetch sweep.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;

use crate::error::{CancelOptions, QueryError};
use crate::focus::{FocusManager, focus_manager};
use crate::infinite::{InfiniteData, InfiniteQueryBehavior, shared_pages};
use crate::key::QueryKey;
use crate::mutation_cache::MutationCache;
use crate::notify::NotifyManager;
use crate::online::{OnlineManager, online_manager};
use crate::options::{DefaultOptions, MutationOptions, QueryOptions};
use crate::query::{FetchOptions, Query, QueryState, SetDataOptions};
use crate::query_cache::{QueryCache, QueryFilters, QueryTypeFilter};
use crate::sharing::{SharedData, StructuralSharing, downcast, shared};

/// Which matching queries an invalidation refetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchType {
    #[default]
    Active,
    Inactive,
    All,
    None,
}

/// Options for [`QueryClient::invalidate_queries`].
#[derive(Clone, Debug)]
pub struct InvalidateOptions {
    pub refetch_type: RefetchType,
    pub cancel_refetch: bool,
    pub throw_on_error: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_type: RefetchType::Active,
            cancel_refetch: true,
            throw_on_error: false,
        }
    }
}

impl InvalidateOptions {
    #[must_use]
    pub fn refetch_type(mut self, refetch_type: RefetchType) -> Self {
        self.refetch_type = refetch_type;
        self
    }
}

/// Options for [`QueryClient::refetch_queries`].
#[derive(Clone, Debug)]
pub struct RefetchOptions {
    pub cancel_refetch: bool,
    pub throw_on_error: bool,
}

impl Default for RefetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            throw_on_error: false,
        }
    }
}

/// Options for [`QueryClient::ensure_query_data`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EnsureOptions {
    /// When the cached data is stale, trigger a background refetch without
    /// awaiting it.
    pub revalidate_if_stale: bool,
}

/// Configuration for a [`QueryClient`].
#[derive(Clone, Default)]
pub struct QueryClientConfig {
    pub query_cache: Option<Arc<QueryCache>>,
    pub mutation_cache: Option<Arc<MutationCache>>,
    pub default_options: DefaultOptions,
    /// Ambient managers, injectable for isolation (tests run one per
    /// client); the process-wide instances are used otherwise.
    pub focus_manager: Option<Arc<FocusManager>>,
    pub online_manager: Option<Arc<OnlineManager>>,
}

struct ClientInner {
    query_cache: Arc<QueryCache>,
    mutation_cache: Arc<MutationCache>,
    focus: Arc<FocusManager>,
    online: Arc<OnlineManager>,
    default_options: Mutex<DefaultOptions>,
    query_defaults: Mutex<Vec<(QueryKey, QueryOptions)>>,
    mutation_defaults: Mutex<Vec<(QueryKey, MutationOptions)>>,
    mount_count: Mutex<usize>,
    focus_subscription: Mutex<Option<u64>>,
    online_subscription: Mutex<Option<u64>>,
}

/// Clonable handle to one cache universe.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    #[must_use]
    pub fn with_config(config: QueryClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                query_cache: config.query_cache.unwrap_or_else(QueryCache::new),
                mutation_cache: config.mutation_cache.unwrap_or_else(MutationCache::new),
                focus: config.focus_manager.unwrap_or_else(focus_manager),
                online: config.online_manager.unwrap_or_else(online_manager),
                default_options: Mutex::new(config.default_options),
                query_defaults: Mutex::new(Vec::new()),
                mutation_defaults: Mutex::new(Vec::new()),
                mount_count: Mutex::new(0),
                focus_subscription: Mutex::new(None),
                online_subscription: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn query_cache(&self) -> Arc<QueryCache> {
        self.inner.query_cache.clone()
    }

    #[must_use]
    pub fn mutation_cache(&self) -> Arc<MutationCache> {
        self.inner.mutation_cache.clone()
    }

    #[must_use]
    pub fn focus_manager(&self) -> Arc<FocusManager> {
        self.inner.focus.clone()
    }

    #[must_use]
    pub fn online_manager(&self) -> Arc<OnlineManager> {
        self.inner.online.clone()
    }

    pub(crate) fn notify_manager(&self) -> Arc<NotifyManager> {
        self.inner.query_cache.notify_manager()
    }

    pub(crate) fn mutation_notify_manager(&self) -> Arc<NotifyManager> {
        self.inner.mutation_cache.notify_manager()
    }

    /// Subscribes this client to the ambient focus/online signals.
    /// Reference-counted: the first mount wires the listeners, the last
    /// unmount removes them.
    pub fn mount(&self) {
        let mut count = self.inner.mount_count.lock();
        *count += 1;
        if *count > 1 {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let focus_id = self.inner.focus.subscribe(move |focused| {
            if focused {
                on_ambient_signal(&weak, AmbientSignal::Focus);
            }
        });
        *self.inner.focus_subscription.lock() = Some(focus_id);

        let weak = Arc::downgrade(&self.inner);
        let online_id = self.inner.online.subscribe(move |online| {
            if online {
                on_ambient_signal(&weak, AmbientSignal::Online);
            }
        });
        *self.inner.online_subscription.lock() = Some(online_id);
    }

    pub fn unmount(&self) {
        let mut count = self.inner.mount_count.lock();
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        if let Some(id) = self.inner.focus_subscription.lock().take() {
            self.inner.focus.unsubscribe(id);
        }
        if let Some(id) = self.inner.online_subscription.lock().take() {
            self.inner.online.unsubscribe(id);
        }
    }

    /// Resolves options against key-matched and client-wide defaults and
    /// computes the query hash.
    #[must_use]
    pub fn default_query_options(&self, options: QueryOptions) -> QueryOptions {
        let mut merged = options;
        if let Some(key) = merged.query_key.clone() {
            let key_defaults = self.get_query_defaults(&key);
            merged = merged.or_defaults(&key_defaults);
        }
        let base = self.inner.default_options.lock().queries.clone();
        let mut merged = merged.or_defaults(&base);
        if merged.query_hash.is_none() {
            merged.query_hash = merged.hash_key();
        }
        merged
    }

    #[must_use]
    pub fn default_mutation_options(&self, options: MutationOptions) -> MutationOptions {
        let mut merged = options;
        if let Some(key) = merged.mutation_key.clone() {
            let key_defaults = self.get_mutation_defaults(&key);
            merged = merged.or_defaults(&key_defaults);
        }
        let base = self.inner.default_options.lock().mutations.clone();
        merged.or_defaults(&base)
    }

    /// Registers defaults for every query whose key starts with
    /// `partial_key`. Re-registering the same key replaces the entry.
    pub fn set_query_defaults(&self, partial_key: QueryKey, options: QueryOptions) {
        let mut defaults = self.inner.query_defaults.lock();
        match defaults.iter_mut().find(|(key, _)| key == &partial_key) {
            Some(entry) => entry.1 = options,
            None => defaults.push((partial_key, options)),
        }
    }

    /// The merged defaults applying to `query_key`: the longest matching
    /// prefix wins, ties resolve in registration order.
    #[must_use]
    pub fn get_query_defaults(&self, query_key: &QueryKey) -> QueryOptions {
        let mut matching: Vec<(usize, usize, QueryOptions)> = self
            .inner
            .query_defaults
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, (partial_key, _))| crate::key::partial_match_key(query_key, partial_key))
            .map(|(index, (partial_key, options))| {
                (index, key_specificity(partial_key), options.clone())
            })
            .collect();
        matching.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut merged = QueryOptions::default();
        for (_, _, options) in matching {
            merged = merged.or_defaults(&options);
        }
        merged
    }

    pub fn set_mutation_defaults(&self, partial_key: QueryKey, options: MutationOptions) {
        let mut defaults = self.inner.mutation_defaults.lock();
        match defaults.iter_mut().find(|(key, _)| key == &partial_key) {
            Some(entry) => entry.1 = options,
            None => defaults.push((partial_key, options)),
        }
    }

    #[must_use]
    pub fn get_mutation_defaults(&self, mutation_key: &QueryKey) -> MutationOptions {
        let mut matching: Vec<(usize, usize, MutationOptions)> = self
            .inner
            .mutation_defaults
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, (partial_key, _))| crate::key::partial_match_key(mutation_key, partial_key))
            .map(|(index, (partial_key, options))| {
                (index, key_specificity(partial_key), options.clone())
            })
            .collect();
        matching.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut merged = MutationOptions::default();
        for (_, _, options) in matching {
            merged = merged.or_defaults(&options);
        }
        merged
    }

    pub(crate) fn build_query(&self, options: &QueryOptions) -> Result<Arc<Query>, QueryError> {
        self.inner
            .query_cache
            .build(self.inner.online.clone(), options.clone(), None)
    }

    /// Fetches the query, or resolves from cache when the data is fresh.
    pub async fn fetch_query(&self, options: QueryOptions) -> Result<SharedData, QueryError> {
        let options = self.default_query_options(options);
        let query = self.build_query(&options)?;
        let stale_time = options.resolved_stale_time(&query);
        if query.is_stale_by_time(&stale_time) {
            query.fetch(Some(&options), FetchOptions::default()).await
        } else {
            match query.state().data {
                Some(data) => Ok(data),
                None => query.fetch(Some(&options), FetchOptions::default()).await,
            }
        }
    }

    /// Typed convenience over [`QueryClient::fetch_query`].
    pub async fn fetch_query_as<T: Send + Sync + 'static>(
        &self,
        options: QueryOptions,
    ) -> Result<Arc<T>, QueryError> {
        let data = self.fetch_query(options).await?;
        downcast::<T>(&data)
            .ok_or_else(|| QueryError::message("cached data has a different type"))
    }

    /// Like `fetch_query` but swallows the outcome; errors are only logged
    /// by the cache layer.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        let _ = self.fetch_query(options).await;
    }

    /// Returns cached data (even falsy) when present, fetching otherwise.
    pub async fn ensure_query_data(
        &self,
        options: QueryOptions,
        ensure: EnsureOptions,
    ) -> Result<SharedData, QueryError> {
        let options = self.default_query_options(options);
        let query = self.build_query(&options)?;
        let cached = query.state().data;

        match cached {
            Some(data) => {
                if ensure.revalidate_if_stale
                    && query.is_stale_by_time(&options.resolved_stale_time(&query))
                {
                    // background revalidation, deliberately not awaited
                    let _ = query.fetch(Some(&options), FetchOptions::default());
                }
                Ok(data)
            }
            None => query.fetch(Some(&options), FetchOptions::default()).await,
        }
    }

    /// Seeds an infinite query, walking up to `options.pages` pages.
    pub async fn fetch_infinite_query(
        &self,
        options: QueryOptions,
    ) -> Result<Arc<InfiniteData>, QueryError> {
        let options = infinite_options(self.default_query_options(options));
        let data = self.fetch_query(options).await?;
        downcast::<InfiniteData>(&data)
            .ok_or_else(|| QueryError::message("infinite query produced unexpected data"))
    }

    pub async fn prefetch_infinite_query(&self, options: QueryOptions) {
        let _ = self.fetch_infinite_query(options).await;
    }

    pub async fn ensure_infinite_query_data(
        &self,
        options: QueryOptions,
        ensure: EnsureOptions,
    ) -> Result<Arc<InfiniteData>, QueryError> {
        let options = infinite_options(self.default_query_options(options));
        let data = self.ensure_query_data(options, ensure).await?;
        downcast::<InfiniteData>(&data)
            .ok_or_else(|| QueryError::message("infinite query produced unexpected data"))
    }

    #[must_use]
    pub fn get_query_data<T: Send + Sync + 'static>(&self, query_key: &QueryKey) -> Option<Arc<T>> {
        self.get_query_data_erased(query_key)
            .and_then(|data| downcast::<T>(&data))
    }

    #[must_use]
    pub fn get_query_data_erased(&self, query_key: &QueryKey) -> Option<SharedData> {
        self.get_query(query_key)?.state().data
    }

    #[must_use]
    pub fn get_query_state(&self, query_key: &QueryKey) -> Option<QueryState> {
        Some(self.get_query(query_key)?.state())
    }

    fn get_query(&self, query_key: &QueryKey) -> Option<Arc<Query>> {
        let options = self.default_query_options(QueryOptions::new(query_key.clone()));
        self.inner.query_cache.get(options.query_hash.as_deref()?)
    }

    #[must_use]
    pub fn get_queries_data(&self, filters: &QueryFilters) -> Vec<(QueryKey, Option<SharedData>)> {
        self.inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .map(|query| (query.query_key().clone(), query.state().data))
            .collect()
    }

    /// Writes a value into the cache. A no-op when `updater` returns `None`;
    /// otherwise the write lands with `manual` semantics (fetch status
    /// untouched).
    pub fn set_query_data<T: Send + Sync + 'static>(
        &self,
        query_key: QueryKey,
        data: T,
    ) -> Option<SharedData> {
        self.set_query_data_with(query_key, move |_| Some(shared(data)), SetDataOptions::default())
    }

    pub fn set_query_data_with(
        &self,
        query_key: QueryKey,
        updater: impl FnOnce(Option<SharedData>) -> Option<SharedData>,
        options: SetDataOptions,
    ) -> Option<SharedData> {
        let defaulted = self.default_query_options(QueryOptions::new(query_key));
        let previous = defaulted
            .query_hash
            .as_deref()
            .and_then(|hash| self.inner.query_cache.get(hash))
            .and_then(|query| query.state().data);

        let data = updater(previous)?;
        let query = self.build_query(&defaulted).ok()?;
        Some(query.set_data(data, options))
    }

    /// Applies an updater to every matching query; returns `(key, new data)`
    /// pairs.
    pub fn set_queries_data(
        &self,
        filters: &QueryFilters,
        updater: impl Fn(Option<SharedData>) -> Option<SharedData>,
    ) -> Vec<(QueryKey, Option<SharedData>)> {
        self.inner.query_cache.notify_manager().batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| {
                    let written = self.set_query_data_with(
                        query.query_key().clone(),
                        &updater,
                        SetDataOptions::default(),
                    );
                    (query.query_key().clone(), written)
                })
                .collect()
        })
    }

    pub fn remove_queries(&self, filters: &QueryFilters) {
        let cache = &self.inner.query_cache;
        cache.notify_manager().batch(|| {
            for query in cache.find_all(filters) {
                cache.remove(&query);
            }
        });
    }

    /// Resets matching queries to their initial state, then refetches the
    /// active ones.
    pub async fn reset_queries(&self, filters: &QueryFilters) -> Result<(), QueryError> {
        let cache = &self.inner.query_cache;
        cache.notify_manager().batch(|| {
            for query in cache.find_all(filters) {
                query.reset();
            }
        });

        let mut refetch_filters = filters.clone();
        refetch_filters.kind = QueryTypeFilter::Active;
        self.refetch_queries(&refetch_filters, RefetchOptions::default())
            .await
    }

    /// Cancels in-flight fetches of matching queries. The default options
    /// revert each query to its pre-fetch snapshot.
    pub async fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        let queries = self.inner.query_cache.find_all(filters);
        join_all(
            queries
                .iter()
                .map(|query| async move { query.cancel(options).await }),
        )
        .await;
    }

    /// Marks matching queries invalidated and refetches them per the
    /// `refetch_type` policy.
    pub async fn invalidate_queries(
        &self,
        filters: &QueryFilters,
        options: InvalidateOptions,
    ) -> Result<(), QueryError> {
        let cache = &self.inner.query_cache;
        cache.notify_manager().batch(|| {
            for query in cache.find_all(filters) {
                query.invalidate();
            }
        });

        let kind = match options.refetch_type {
            RefetchType::None => return Ok(()),
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
        };
        let mut refetch_filters = filters.clone();
        refetch_filters.kind = kind;
        self.refetch_queries(
            &refetch_filters,
            RefetchOptions {
                cancel_refetch: options.cancel_refetch,
                throw_on_error: options.throw_on_error,
            },
        )
        .await
    }

    /// Refetches matching queries, resolving once every refetch settled.
    pub async fn refetch_queries(
        &self,
        filters: &QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let cache = &self.inner.query_cache;
        let promises: Vec<_> = cache.notify_manager().batch(|| {
            cache
                .find_all(filters)
                .into_iter()
                .filter(|query| !query.is_disabled() && !query.is_static())
                .map(|query| {
                    query.fetch(
                        None,
                        FetchOptions {
                            cancel_refetch: options.cancel_refetch,
                            meta: None,
                        },
                    )
                })
                .collect()
        });

        let outcomes = join_all(promises).await;
        if options.throw_on_error {
            for outcome in outcomes {
                if let Err(error) = outcome {
                    if !error.is_cancelled() {
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    /// The number of queries currently fetching.
    #[must_use]
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        let mut filters = filters.clone();
        filters.fetch_status = Some(crate::query::FetchStatus::Fetching);
        self.inner.query_cache.find_all(&filters).len()
    }

    /// The number of matching mutations currently pending.
    #[must_use]
    pub fn is_mutating(&self, filters: &crate::mutation_cache::MutationFilters) -> usize {
        let mut filters = filters.clone();
        filters.status = Some(crate::mutation::MutationStatus::Pending);
        self.inner.mutation_cache.find_all(&filters).len()
    }

    /// Resumes every paused mutation; resolves when all of them settled.
    pub async fn resume_paused_mutations(&self) {
        self.inner.mutation_cache.resume_paused_mutations().await;
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }

    #[must_use]
    pub fn default_options(&self) -> DefaultOptions {
        self.inner.default_options.lock().clone()
    }

    pub fn set_default_options(&self, options: DefaultOptions) {
        *self.inner.default_options.lock() = options;
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

enum AmbientSignal {
    Focus,
    Online,
}

/// Focus/online transitions resume paused mutations first, then run the
/// refetch sweep, so paused retries settle before "refetch on reconnect"
/// fires.
fn on_ambient_signal(inner: &Weak<ClientInner>, signal: AmbientSignal) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        inner.mutation_cache.resume_paused_mutations().await;
        match signal {
            AmbientSignal::Focus => inner.query_cache.on_focus(),
            AmbientSignal::Online => inner.query_cache.on_online(),
        }
    });
}

/// Prepares options for the infinite entry points: installs the page-walking
/// behavior and lifts whatever structural sharing the per-page query
/// function configured into a page-aware merge over the whole data.
fn infinite_options(mut options: QueryOptions) -> QueryOptions {
    options.behavior = Some(Arc::new(InfiniteQueryBehavior));
    let page_policy = options
        .structural_sharing
        .take()
        .unwrap_or(StructuralSharing::Disabled);
    options.structural_sharing = Some(shared_pages(page_policy));
    options
}

fn key_specificity(key: &QueryKey) -> usize {
    match key {
        serde_json::Value::Array(items) => items.len(),
        _ => 1,
    }
}
