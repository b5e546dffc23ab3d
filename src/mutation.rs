//! One execution of a side-effectful operation.
//!
//! A mutation runs its function through a retryer with the mutation's
//! network mode, so it can pause offline and resume later, and drives the
//! lifecycle callbacks around it: `on_mutate` before the attempt (its return
//! value becomes the context), then `on_success`/`on_error` and `on_settled`
//! after. A callback failure on the success path fails the mutation; on the
//! error path the original error always wins.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::gc::GcTimer;
use crate::mutation_cache::{MutationCache, MutationCacheEvent};
use crate::mutation_observer::MutationObserver;
use crate::online::OnlineManager;
use crate::options::MutationOptions;
use crate::retry::{Retryer, RetryerConfig, RetryerHandle};
use crate::sharing::SharedData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// The full state of one mutation.
#[derive(Clone, Default)]
pub struct MutationState {
    pub context: Option<SharedData>,
    pub data: Option<SharedData>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub is_paused: bool,
    pub status: MutationStatus,
    pub submitted_at: Option<Instant>,
    pub variables: Option<SharedData>,
}

impl MutationState {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.status, MutationStatus::Success | MutationStatus::Error)
    }
}

impl std::fmt::Debug for MutationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationState")
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("failure_count", &self.failure_count)
            .field("is_paused", &self.is_paused)
            .field("status", &self.status)
            .field("has_variables", &self.variables.is_some())
            .finish_non_exhaustive()
    }
}

/// Actions the mutation reducer understands.
#[derive(Clone)]
pub enum MutationAction {
    Pending {
        variables: SharedData,
        is_paused: bool,
        submitted_at: Instant,
    },
    Context {
        context: Option<SharedData>,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Success {
        data: SharedData,
    },
    Error {
        error: QueryError,
    },
}

impl std::fmt::Debug for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending { .. } => "Pending",
            Self::Context { .. } => "Context",
            Self::Failed { .. } => "Failed",
            Self::Pause => "Pause",
            Self::Continue => "Continue",
            Self::Success { .. } => "Success",
            Self::Error { .. } => "Error",
        };
        f.write_str(name)
    }
}

/// One mutation entry in the cache.
pub struct Mutation {
    mutation_id: u64,
    cache: Weak<MutationCache>,
    online: Arc<OnlineManager>,
    options: Mutex<MutationOptions>,
    state: Mutex<MutationState>,
    observers: Mutex<Vec<Weak<MutationObserver>>>,
    retryer: Mutex<Option<RetryerHandle>>,
    settled: Notify,
    gc: GcTimer,
}

impl Mutation {
    pub(crate) fn new(
        mutation_id: u64,
        cache: &Arc<MutationCache>,
        online: Arc<OnlineManager>,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mutation_id,
            cache: Arc::downgrade(cache),
            online,
            options: Mutex::new(options),
            state: Mutex::new(state.unwrap_or_default()),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            settled: Notify::new(),
            gc: GcTimer::new(),
        })
    }

    #[must_use]
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    #[must_use]
    pub fn state(&self) -> MutationState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn options(&self) -> MutationOptions {
        self.options.lock().clone()
    }

    pub(crate) fn set_options(&self, options: MutationOptions) {
        *self.options.lock() = options;
    }

    #[must_use]
    pub fn scope_id(&self) -> Option<String> {
        self.options.lock().scope.as_ref().map(|scope| scope.id.clone())
    }

    pub(crate) fn observers(&self) -> Vec<Arc<MutationObserver>> {
        let mut observers = self.observers.lock();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    #[must_use]
    pub fn observers_count(&self) -> usize {
        self.observers().len()
    }

    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<MutationObserver>) {
        {
            let mut observers = self.observers.lock();
            let incoming = Arc::downgrade(observer);
            if !observers.iter().any(|weak| weak.ptr_eq(&incoming)) {
                observers.push(incoming);
            }
        }
        self.gc.cancel();
        self.notify_cache(MutationCacheEvent::ObserverAdded {
            mutation: self.clone(),
        });
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, observer: &Arc<MutationObserver>) {
        let remaining = {
            let mut observers = self.observers.lock();
            let leaving = Arc::downgrade(observer);
            observers.retain(|weak| !weak.ptr_eq(&leaving) && weak.strong_count() > 0);
            observers.len()
        };
        if remaining == 0 && self.state().is_settled() {
            self.schedule_gc();
        }
        self.notify_cache(MutationCacheEvent::ObserverRemoved {
            mutation: self.clone(),
        });
    }

    /// Runs the mutation to settlement.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        variables: SharedData,
    ) -> Result<SharedData, QueryError> {
        let Some(cache) = self.cache.upgrade() else {
            return Err(QueryError::message("mutation cache dropped"));
        };
        let options = self.options();
        let Some(mutation_fn) = options.mutation_fn.clone() else {
            return Err(QueryError::message("no mutation function configured"));
        };

        let weak = Arc::downgrade(self);
        let weak_cache = Arc::downgrade(&cache);
        let mut config = RetryerConfig::new(
            {
                let variables = variables.clone();
                move || mutation_fn(variables.clone())
            },
            self.online.clone(),
        );
        config.on_fail = Some(Box::new({
            let weak = weak.clone();
            move |failure_count, error| {
                if let Some(mutation) = weak.upgrade() {
                    mutation.dispatch(MutationAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }
        }));
        config.on_pause = Some(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(mutation) = weak.upgrade() {
                    mutation.dispatch(MutationAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(mutation) = weak.upgrade() {
                    mutation.dispatch(MutationAction::Continue);
                }
            }
        }));
        config.retry = options.resolved_retry();
        config.retry_delay = options.resolved_retry_delay();
        config.network_mode = options.resolved_network_mode();
        config.can_run = Box::new({
            let weak = weak.clone();
            move || match (weak.upgrade(), weak_cache.upgrade()) {
                (Some(mutation), Some(cache)) => cache.can_run(&mutation),
                _ => true,
            }
        });

        let restored = self.state().status == MutationStatus::Pending;
        let can_start = options
            .resolved_network_mode()
            .can_start(self.online.is_online())
            && cache.can_run(self);

        let (handle, retry_future) = Retryer::start(config);
        *self.retryer.lock() = Some(handle);

        let attempt: Result<SharedData, QueryError> = async {
            if !restored {
                self.dispatch(MutationAction::Pending {
                    variables: variables.clone(),
                    is_paused: !can_start,
                    submitted_at: Instant::now(),
                });
                cache.run_on_mutate(&variables, self).await?;
                if let Some(on_mutate) = options.on_mutate.clone() {
                    let context = on_mutate(variables.clone()).await?;
                    if context.is_some() {
                        self.dispatch(MutationAction::Context { context });
                    }
                }
            }
            retry_future.await
        }
        .await;

        let settled = match attempt {
            Ok(data) => {
                let callbacks: Result<(), QueryError> = async {
                    cache.run_on_success(&data, &variables, self).await?;
                    if let Some(on_success) = options.on_success.clone() {
                        on_success(data.clone(), variables.clone(), self.state().context).await?;
                    }
                    cache.run_on_settled(Some(&data), None, &variables, self).await?;
                    if let Some(on_settled) = options.on_settled.clone() {
                        on_settled(Some(data.clone()), None, variables.clone(), self.state().context)
                            .await?;
                    }
                    Ok(())
                }
                .await;

                match callbacks {
                    Ok(()) => {
                        self.dispatch(MutationAction::Success { data: data.clone() });
                        Ok(data)
                    }
                    Err(error) => {
                        self.dispatch(MutationAction::Error {
                            error: error.clone(),
                        });
                        Err(error)
                    }
                }
            }
            Err(error) => {
                // callback failures here never mask the original error
                cache.run_on_error(&error, &variables, self).await;
                if let Some(on_error) = options.on_error.clone() {
                    let _ = on_error(error.clone(), variables.clone(), self.state().context).await;
                }
                let _ = cache.run_on_settled(None, Some(&error), &variables, self).await;
                if let Some(on_settled) = options.on_settled.clone() {
                    let _ = on_settled(
                        None,
                        Some(error.clone()),
                        variables.clone(),
                        self.state().context,
                    )
                    .await;
                }

                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
                if self.observers_count() == 0 {
                    tracing::error!(
                        mutation_id = self.mutation_id,
                        error = %error,
                        "unobserved mutation failed"
                    );
                }
                Err(error)
            }
        };

        *self.retryer.lock() = None;
        if self.observers_count() == 0 {
            self.schedule_gc();
        }
        cache.run_next(self);
        settled
    }

    /// Resumes a paused mutation: wakes the parked retryer, or re-executes a
    /// rebuilt (hydrated) mutation from its stored variables. Resolves once
    /// the mutation settles.
    pub(crate) async fn continue_mutation(self: &Arc<Self>) {
        let handle = self.retryer.lock().clone();
        match handle {
            Some(handle) => {
                handle.resume();
                self.await_settled().await;
            }
            None => {
                let variables = self.state().variables;
                if let Some(variables) = variables {
                    let _ = self.execute(variables).await;
                }
            }
        }
    }

    pub(crate) async fn await_settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.state().is_settled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, action: MutationAction) {
        {
            let mut state = self.state.lock();
            let next = reduce(&state, &action);
            *state = next;
        }
        if self.state().is_settled() {
            self.settled.notify_waiters();
        }

        if let Some(cache) = self.cache.upgrade() {
            let mutation = self.clone();
            cache.notify_manager().batch(|| {
                for observer in mutation.observers() {
                    observer.on_mutation_update(&action);
                }
                cache.notify(MutationCacheEvent::Updated {
                    mutation: mutation.clone(),
                    action,
                });
            });
        } else {
            for observer in self.observers() {
                observer.on_mutation_update(&action);
            }
        }
    }

    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.gc
            .schedule(self.options().resolved_gc_time(), move || {
                if let Some(mutation) = weak.upgrade() {
                    mutation.try_evict();
                }
            });
    }

    fn try_evict(self: &Arc<Self>) {
        if self.observers().is_empty() && self.state().status != MutationStatus::Pending {
            if let Some(cache) = self.cache.upgrade() {
                cache.remove(self);
            }
        }
    }

    pub(crate) fn destroy(&self) {
        self.gc.cancel();
    }

    fn notify_cache(&self, event: MutationCacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify(event);
        }
    }
}

fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
    let mut next = state.clone();
    match action {
        MutationAction::Pending {
            variables,
            is_paused,
            submitted_at,
        } => {
            next = MutationState {
                context: None,
                data: None,
                error: None,
                failure_count: 0,
                failure_reason: None,
                is_paused: *is_paused,
                status: MutationStatus::Pending,
                submitted_at: Some(*submitted_at),
                variables: Some(variables.clone()),
            };
        }
        MutationAction::Context { context } => {
            next.context = context.clone();
        }
        MutationAction::Failed {
            failure_count,
            error,
        } => {
            next.failure_count = *failure_count;
            next.failure_reason = Some(error.clone());
        }
        MutationAction::Pause => {
            next.is_paused = true;
        }
        MutationAction::Continue => {
            next.is_paused = false;
        }
        MutationAction::Success { data } => {
            next.data = Some(data.clone());
            next.error = None;
            next.status = MutationStatus::Success;
            next.is_paused = false;
        }
        MutationAction::Error { error } => {
            next.error = Some(error.clone());
            next.failure_count = state.failure_count + 1;
            next.failure_reason = Some(error.clone());
            next.is_paused = false;
            next.status = MutationStatus::Error;
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::shared;

    #[test]
    fn test_reduce_pending_resets_previous_run() {
        let state = MutationState {
            data: Some(shared(1u32)),
            error: Some(QueryError::message("old")),
            failure_count: 2,
            status: MutationStatus::Error,
            ..MutationState::default()
        };

        let next = reduce(
            &state,
            &MutationAction::Pending {
                variables: shared("vars".to_string()),
                is_paused: true,
                submitted_at: Instant::now(),
            },
        );
        assert_eq!(next.status, MutationStatus::Pending);
        assert!(next.is_paused);
        assert!(next.data.is_none());
        assert!(next.error.is_none());
        assert_eq!(next.failure_count, 0);
        assert!(next.variables.is_some());
        assert!(next.submitted_at.is_some());
    }

    #[test]
    fn test_reduce_terminal_transitions() {
        let pending = MutationState {
            status: MutationStatus::Pending,
            is_paused: true,
            ..MutationState::default()
        };

        let success = reduce(
            &pending,
            &MutationAction::Success {
                data: shared(5u32),
            },
        );
        assert_eq!(success.status, MutationStatus::Success);
        assert!(!success.is_paused);
        assert!(success.is_settled());

        let failed = reduce(
            &pending,
            &MutationAction::Error {
                error: QueryError::message("oops"),
            },
        );
        assert_eq!(failed.status, MutationStatus::Error);
        assert_eq!(failed.failure_count, 1);
        assert!(!failed.is_paused);
        assert!(failed.is_settled());
    }

    #[test]
    fn test_reduce_pause_continue_toggle() {
        let pending = MutationState {
            status: MutationStatus::Pending,
            ..MutationState::default()
        };
        let paused = reduce(&pending, &MutationAction::Pause);
        assert!(paused.is_paused);
        let resumed = reduce(&paused, &MutationAction::Continue);
        assert!(!resumed.is_paused);
    }
}
