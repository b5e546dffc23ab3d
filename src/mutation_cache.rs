//! The list of recent and in-flight mutations.
//!
//! Orders mutations by creation, serializes the ones sharing a scope id
//! (first pending wins, the rest park in paused until `run_next` wakes
//! them), and resumes everything paused after a network transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;

use crate::error::QueryError;
use crate::key::{QueryKey, partial_match_key};
use crate::listeners::ListenerSet;
use crate::mutation::{Mutation, MutationAction, MutationState, MutationStatus};
use crate::notify::NotifyManager;
use crate::online::OnlineManager;
use crate::options::MutationOptions;
use crate::sharing::SharedData;

type CacheCallback<T> = Arc<T>;

/// Cache-level lifecycle callbacks, invoked for every mutation regardless of
/// observers. A rejection from `on_mutate`, `on_success` or `on_settled`
/// fails the mutation like a query-function failure would.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    pub on_mutate: Option<
        CacheCallback<
            dyn Fn(
                    SharedData,
                    Arc<Mutation>,
                ) -> futures::future::BoxFuture<'static, Result<(), QueryError>>
                + Send
                + Sync,
        >,
    >,
    pub on_success: Option<
        CacheCallback<
            dyn Fn(
                    SharedData,
                    SharedData,
                    Arc<Mutation>,
                ) -> futures::future::BoxFuture<'static, Result<(), QueryError>>
                + Send
                + Sync,
        >,
    >,
    pub on_error: Option<
        CacheCallback<
            dyn Fn(
                    QueryError,
                    SharedData,
                    Arc<Mutation>,
                ) -> futures::future::BoxFuture<'static, Result<(), QueryError>>
                + Send
                + Sync,
        >,
    >,
    pub on_settled: Option<
        CacheCallback<
            dyn Fn(
                    Option<SharedData>,
                    Option<QueryError>,
                    SharedData,
                    Arc<Mutation>,
                ) -> futures::future::BoxFuture<'static, Result<(), QueryError>>
                + Send
                + Sync,
        >,
    >,
}

/// Events emitted to mutation cache subscribers.
#[derive(Clone)]
pub enum MutationCacheEvent {
    Added { mutation: Arc<Mutation> },
    Removed { mutation: Arc<Mutation> },
    Updated {
        mutation: Arc<Mutation>,
        action: MutationAction,
    },
    ObserverAdded { mutation: Arc<Mutation> },
    ObserverRemoved { mutation: Arc<Mutation> },
}

impl std::fmt::Debug for MutationCacheEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, mutation) = match self {
            Self::Added { mutation } => ("Added", mutation),
            Self::Removed { mutation } => ("Removed", mutation),
            Self::Updated { mutation, .. } => ("Updated", mutation),
            Self::ObserverAdded { mutation } => ("ObserverAdded", mutation),
            Self::ObserverRemoved { mutation } => ("ObserverRemoved", mutation),
        };
        write!(f, "MutationCacheEvent::{name}(#{})", mutation.mutation_id())
    }
}

/// Filter set for mutation lookups.
#[derive(Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<QueryKey>,
    pub exact: bool,
    pub status: Option<MutationStatus>,
    pub predicate: Option<Arc<dyn Fn(&Arc<Mutation>) -> bool + Send + Sync>>,
}

impl MutationFilters {
    #[must_use]
    pub fn key(mutation_key: QueryKey) -> Self {
        Self {
            mutation_key: Some(mutation_key),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn predicate(
        mut self,
        predicate: impl Fn(&Arc<Mutation>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn matches(&self, mutation: &Arc<Mutation>) -> bool {
        if let Some(filter_key) = &self.mutation_key {
            let Some(key) = mutation.options().mutation_key else {
                return false;
            };
            if self.exact {
                if &key != filter_key {
                    return false;
                }
            } else if !partial_match_key(&key, filter_key) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

pub struct MutationCache {
    mutations: Mutex<Vec<Arc<Mutation>>>,
    listeners: ListenerSet<MutationCacheEvent>,
    notify: Arc<NotifyManager>,
    next_id: AtomicU64,
    config: MutationCacheConfig,
}

impl MutationCache {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(MutationCacheConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MutationCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            mutations: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
            notify: Arc::new(NotifyManager::new()),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    pub(crate) fn notify_manager(&self) -> Arc<NotifyManager> {
        self.notify.clone()
    }

    /// Creates a mutation and registers it. Mutation ids increase
    /// monotonically, so list order is submission order.
    pub(crate) fn build(
        self: &Arc<Self>,
        online: Arc<OnlineManager>,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Arc<Mutation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mutation = Mutation::new(id, self, online, options, state);
        self.mutations.lock().push(mutation.clone());
        tracing::debug!(mutation_id = id, "mutation added to cache");
        self.notify(MutationCacheEvent::Added {
            mutation: mutation.clone(),
        });
        mutation
    }

    pub(crate) fn remove(self: &Arc<Self>, mutation: &Arc<Mutation>) {
        let removed = {
            let mut mutations = self.mutations.lock();
            let before = mutations.len();
            mutations.retain(|existing| !Arc::ptr_eq(existing, mutation));
            mutations.len() != before
        };
        if removed {
            mutation.destroy();
            self.notify(MutationCacheEvent::Removed {
                mutation: mutation.clone(),
            });
        }
    }

    pub fn clear(self: &Arc<Self>) {
        self.notify.batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Mutation>> {
        self.mutations.lock().clone()
    }

    #[must_use]
    pub fn find(&self, filters: &MutationFilters) -> Option<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .find(|mutation| filters.matches(mutation))
    }

    #[must_use]
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .filter(|mutation| filters.matches(mutation))
            .collect()
    }

    /// Whether `mutation` may run now. Unscoped mutations always may; within
    /// a scope only the first pending mutation in submission order does.
    #[must_use]
    pub(crate) fn can_run(&self, mutation: &Arc<Mutation>) -> bool {
        let Some(scope) = mutation.scope_id() else {
            return true;
        };
        let first_pending = self
            .mutations
            .lock()
            .iter()
            .find(|existing| {
                existing.state().status == MutationStatus::Pending
                    && existing.scope_id().as_deref() == Some(scope.as_str())
            })
            .cloned();
        match first_pending {
            None => true,
            Some(first) => Arc::ptr_eq(&first, mutation),
        }
    }

    /// Wakes the next paused mutation in the settled mutation's scope.
    pub(crate) fn run_next(self: &Arc<Self>, finished: &Arc<Mutation>) {
        let Some(scope) = finished.scope_id() else {
            return;
        };
        let next = self
            .mutations
            .lock()
            .iter()
            .find(|existing| {
                !Arc::ptr_eq(existing, finished)
                    && existing.state().is_paused
                    && existing.scope_id().as_deref() == Some(scope.as_str())
            })
            .cloned();
        if let Some(next) = next {
            tokio::spawn(async move {
                next.continue_mutation().await;
            });
        }
    }

    /// Resumes every paused mutation and resolves when all of them have
    /// settled. Scoped lanes drain in FIFO order; independent lanes run in
    /// parallel.
    pub async fn resume_paused_mutations(self: &Arc<Self>) {
        let paused: Vec<Arc<Mutation>> = self
            .get_all()
            .into_iter()
            .filter(|mutation| mutation.state().is_paused)
            .collect();
        join_all(
            paused
                .into_iter()
                .map(|mutation| async move { mutation.continue_mutation().await }),
        )
        .await;
    }

    pub(crate) fn notify(self: &Arc<Self>, event: MutationCacheEvent) {
        let cache = self.clone();
        self.notify.schedule(move || cache.listeners.emit(&event));
    }

    pub fn subscribe(&self, listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static) -> u64 {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub(crate) async fn run_on_mutate(
        &self,
        variables: &SharedData,
        mutation: &Arc<Mutation>,
    ) -> Result<(), QueryError> {
        if let Some(on_mutate) = &self.config.on_mutate {
            on_mutate(variables.clone(), mutation.clone()).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_on_success(
        &self,
        data: &SharedData,
        variables: &SharedData,
        mutation: &Arc<Mutation>,
    ) -> Result<(), QueryError> {
        if let Some(on_success) = &self.config.on_success {
            on_success(data.clone(), variables.clone(), mutation.clone()).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_on_error(
        &self,
        error: &QueryError,
        variables: &SharedData,
        mutation: &Arc<Mutation>,
    ) {
        if let Some(on_error) = &self.config.on_error {
            let _ = on_error(error.clone(), variables.clone(), mutation.clone()).await;
        }
    }

    pub(crate) async fn run_on_settled(
        &self,
        data: Option<&SharedData>,
        error: Option<&QueryError>,
        variables: &SharedData,
        mutation: &Arc<Mutation>,
    ) -> Result<(), QueryError> {
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(
                data.cloned(),
                error.cloned(),
                variables.clone(),
                mutation.clone(),
            )
            .await?;
        }
        Ok(())
    }
}
