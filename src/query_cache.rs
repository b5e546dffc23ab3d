//! The keyed map of queries.
//!
//! Find/build/remove entries by hash, filter them for the bulk client
//! commands, and fan cache events out to subscribers. Focus and reconnect
//! signals enter here and walk every entry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::QueryError;
use crate::key::{QueryKey, hash_query_key_with, partial_match_key};
use crate::notify::NotifyManager;
use crate::listeners::ListenerSet;
use crate::online::OnlineManager;
use crate::query::{FetchStatus, Query, QueryAction, QueryState};
use crate::options::QueryOptions;
use crate::sharing::SharedData;

/// Cache-level lifecycle callbacks, invoked for every query's terminal fetch
/// outcome.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    pub on_error: Option<Arc<dyn Fn(&QueryError, &Arc<Query>) + Send + Sync>>,
    pub on_success: Option<Arc<dyn Fn(&SharedData, &Arc<Query>) + Send + Sync>>,
    pub on_settled:
        Option<Arc<dyn Fn(Option<&SharedData>, Option<&QueryError>, &Arc<Query>) + Send + Sync>>,
}

/// Events emitted to cache subscribers.
#[derive(Clone)]
pub enum QueryCacheEvent {
    Added { query: Arc<Query> },
    Removed { query: Arc<Query> },
    Updated { query: Arc<Query>, action: QueryAction },
    ObserverAdded { query: Arc<Query> },
    ObserverRemoved { query: Arc<Query> },
    ObserverResultsUpdated { query: Arc<Query> },
}

impl QueryCacheEvent {
    #[must_use]
    pub fn query(&self) -> &Arc<Query> {
        match self {
            Self::Added { query }
            | Self::Removed { query }
            | Self::Updated { query, .. }
            | Self::ObserverAdded { query }
            | Self::ObserverRemoved { query }
            | Self::ObserverResultsUpdated { query } => query,
        }
    }
}

impl std::fmt::Debug for QueryCacheEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Added { .. } => "Added",
            Self::Removed { .. } => "Removed",
            Self::Updated { .. } => "Updated",
            Self::ObserverAdded { .. } => "ObserverAdded",
            Self::ObserverRemoved { .. } => "ObserverRemoved",
            Self::ObserverResultsUpdated { .. } => "ObserverResultsUpdated",
        };
        write!(f, "QueryCacheEvent::{name}({})", self.query().query_hash())
    }
}

/// Which queries a bulk command applies to, by observer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    #[default]
    All,
    /// At least one enabled observer.
    Active,
    Inactive,
}

/// Filter set used by `find`/`find_all` and the bulk client commands.
#[derive(Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    /// Match the key exactly (by hash) instead of as a prefix.
    pub exact: bool,
    pub kind: QueryTypeFilter,
    pub stale: Option<bool>,
    pub fetch_status: Option<FetchStatus>,
    pub predicate: Option<Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>>,
}

impl QueryFilters {
    #[must_use]
    pub fn key(query_key: QueryKey) -> Self {
        Self {
            query_key: Some(query_key),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    #[must_use]
    pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    #[must_use]
    pub fn predicate(mut self, predicate: impl Fn(&Arc<Query>) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn matches(&self, query: &Arc<Query>) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                let options = query.options();
                let hash = hash_query_key_with(key, options.query_key_hash_fn.as_ref());
                if hash != query.query_hash() {
                    return false;
                }
            } else if !partial_match_key(query.query_key(), key) {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active => {
                if !query.is_active() {
                    return false;
                }
            }
            QueryTypeFilter::Inactive => {
                if query.is_active() {
                    return false;
                }
            }
        }

        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

pub struct QueryCache {
    queries: DashMap<String, Arc<Query>>,
    listeners: ListenerSet<QueryCacheEvent>,
    notify: Arc<NotifyManager>,
    config: QueryCacheConfig,
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(QueryCacheConfig::default())
    }

    #[must_use]
    pub fn with_config(config: QueryCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            queries: DashMap::new(),
            listeners: ListenerSet::new(),
            notify: Arc::new(NotifyManager::new()),
            config,
        })
    }

    pub(crate) fn notify_manager(&self) -> Arc<NotifyManager> {
        self.notify.clone()
    }

    /// Finds the query for the options' hash, or creates and registers it.
    pub(crate) fn build(
        self: &Arc<Self>,
        online: Arc<OnlineManager>,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Result<Arc<Query>, QueryError> {
        let Some(query_key) = options.query_key.clone() else {
            return Err(QueryError::message("query options require a query key"));
        };
        let query_hash = options
            .query_hash
            .clone()
            .or_else(|| options.hash_key())
            .unwrap_or_default();

        let query = {
            use dashmap::mapref::entry::Entry;
            match self.queries.entry(query_hash.clone()) {
                Entry::Occupied(entry) => return Ok(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let query =
                        Query::new(self, online, query_hash.clone(), query_key, options, state);
                    entry.insert(query.clone());
                    query
                }
            }
        };

        query.schedule_gc();
        tracing::debug!(query_hash = %query_hash, "query added to cache");
        self.notify(QueryCacheEvent::Added {
            query: query.clone(),
        });
        Ok(query)
    }

    #[must_use]
    pub fn get(&self, query_hash: &str) -> Option<Arc<Query>> {
        self.queries.get(query_hash).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn remove(self: &Arc<Self>, query: &Arc<Query>) {
        let removed = self
            .queries
            .remove_if(query.query_hash(), |_, existing| Arc::ptr_eq(existing, query))
            .is_some();
        if removed {
            query.destroy();
            tracing::debug!(query_hash = %query.query_hash(), "query removed from cache");
            self.notify(QueryCacheEvent::Removed {
                query: query.clone(),
            });
        }
    }

    pub fn clear(self: &Arc<Self>) {
        self.notify.batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    #[must_use]
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<Query>> {
        let mut filters = filters.clone();
        // a bare find defaults to exact key matching
        if filters.query_key.is_some() {
            filters.exact = true;
        }
        self.get_all()
            .into_iter()
            .find(|query| filters.matches(query))
    }

    #[must_use]
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect()
    }

    /// Fans a cache event out to subscribers, batched with whatever
    /// notification pass is in flight.
    pub(crate) fn notify(self: &Arc<Self>, event: QueryCacheEvent) {
        let cache = self.clone();
        self.notify.schedule(move || cache.listeners.emit(&event));
    }

    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static) -> u64 {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Focus sweep: every query gets a chance to refetch and to resume a
    /// paused retryer.
    pub(crate) fn on_focus(self: &Arc<Self>) {
        self.notify.batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Reconnect sweep: resumes paused retryers and refetches per observer
    /// policy.
    pub(crate) fn on_online(self: &Arc<Self>) {
        self.notify.batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    pub(crate) fn on_query_success(&self, data: &SharedData, query: &Arc<Query>) {
        if let Some(on_success) = &self.config.on_success {
            on_success(data, query);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(Some(data), None, query);
        }
    }

    pub(crate) fn on_query_error(&self, error: &QueryError, query: &Arc<Query>) {
        if let Some(on_error) = &self.config.on_error {
            on_error(error, query);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(None, Some(error), query);
        }
    }
}
