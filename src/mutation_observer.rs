//! The per-subscriber view of a mutation.
//!
//! An observer derives a result from its latest mutation and relays per-call
//! callbacks: when `mutate` is called again on the same observer, the
//! earlier call's callbacks are dropped and only the newest caller is
//! notified. Cache-level callbacks are unaffected by this and fire for every
//! mutation.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use crate::client::QueryClient;
use crate::error::{CancelOptions, QueryError};
use crate::listeners::ListenerSet;
use crate::mutation::{Mutation, MutationAction, MutationStatus};
use crate::options::MutationOptions;
use crate::sharing::{SharedData, downcast, shared};

/// Per-`mutate`-call callbacks. Only the latest caller of a shared observer
/// receives them.
#[derive(Clone, Default)]
pub struct MutateCallbacks {
    pub on_success: Option<Arc<dyn Fn(&SharedData, &SharedData, Option<&SharedData>) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&QueryError, &SharedData, Option<&SharedData>) + Send + Sync>>,
    pub on_settled: Option<
        Arc<
            dyn Fn(Option<&SharedData>, Option<&QueryError>, &SharedData, Option<&SharedData>)
                + Send
                + Sync,
        >,
    >,
}

/// The derived, observable result of one mutation subscription.
#[derive(Clone)]
pub struct MutationObserverResult {
    pub data: Option<SharedData>,
    pub error: Option<QueryError>,
    pub status: MutationStatus,
    pub is_idle: bool,
    pub is_pending: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_paused: bool,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub variables: Option<SharedData>,
    pub context: Option<SharedData>,
    pub submitted_at: Option<Instant>,
    pub mutate: MutateHandle,
}

impl MutationObserverResult {
    #[must_use]
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.as_ref().and_then(downcast::<T>)
    }
}

impl std::fmt::Debug for MutationObserverResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationObserverResult")
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("status", &self.status)
            .field("is_paused", &self.is_paused)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}

/// Clonable handle that starts a mutation through its observer; usable after
/// being detached from the result struct.
#[derive(Clone)]
pub struct MutateHandle {
    observer: Weak<MutationObserver>,
}

impl MutateHandle {
    /// Fires the mutation and returns its join future, or `None` if the
    /// observer is gone.
    pub fn call(&self, variables: SharedData) -> Option<MutationJoin> {
        self.observer
            .upgrade()
            .map(|observer| observer.mutate_erased(variables, None))
    }
}

impl std::fmt::Debug for MutateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MutateHandle")
    }
}

/// Future resolving with a mutation's terminal outcome.
pub struct MutationJoin {
    rx: oneshot::Receiver<Result<SharedData, QueryError>>,
}

impl Future for MutationJoin {
    type Output = Result<SharedData, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(QueryError::Cancelled(CancelOptions::silent())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One subscription to a mutation.
pub struct MutationObserver {
    client: QueryClient,
    options: Mutex<MutationOptions>,
    mutation: Mutex<Option<Arc<Mutation>>>,
    result: Mutex<MutationObserverResult>,
    listeners: ListenerSet<MutationObserverResult>,
    mutate_callbacks: Mutex<Option<MutateCallbacks>>,
    watch_tx: watch::Sender<MutationObserverResult>,
}

impl MutationObserver {
    #[must_use]
    pub fn new(client: &QueryClient, options: MutationOptions) -> Arc<Self> {
        let options = client.default_mutation_options(options);

        let observer = Arc::new_cyclic(|weak: &Weak<Self>| {
            let idle = idle_result(weak.clone());
            let (watch_tx, _watch_rx) = watch::channel(idle.clone());
            Self {
                client: client.clone(),
                options: Mutex::new(options),
                mutation: Mutex::new(None),
                result: Mutex::new(idle),
                listeners: ListenerSet::new(),
                mutate_callbacks: Mutex::new(None),
                watch_tx,
            }
        });
        observer
    }

    #[must_use]
    pub fn options(&self) -> MutationOptions {
        self.options.lock().clone()
    }

    pub fn set_options(self: &Arc<Self>, options: MutationOptions) {
        let options = self.client.default_mutation_options(options);
        *self.options.lock() = options.clone();
        if let Some(mutation) = self.mutation.lock().clone() {
            mutation.set_options(options);
        }
    }

    #[must_use]
    pub fn current_result(&self) -> MutationObserverResult {
        self.result.lock().clone()
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult) + Send + Sync + 'static,
    ) -> u64 {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// The observer's results as a stream.
    #[must_use]
    pub fn stream(&self) -> WatchStream<MutationObserverResult> {
        WatchStream::new(self.watch_tx.subscribe())
    }

    /// Starts the mutation with typed variables.
    pub fn mutate<V: Send + Sync + 'static>(
        self: &Arc<Self>,
        variables: V,
        callbacks: Option<MutateCallbacks>,
    ) -> MutationJoin {
        self.mutate_erased(shared(variables), callbacks)
    }

    /// Starts the mutation. The previous call's per-call callbacks are
    /// replaced; cache-level callbacks still fire for the superseded
    /// mutation.
    pub fn mutate_erased(
        self: &Arc<Self>,
        variables: SharedData,
        callbacks: Option<MutateCallbacks>,
    ) -> MutationJoin {
        *self.mutate_callbacks.lock() = callbacks;

        let options = self.options();
        let mutation = self
            .client
            .mutation_cache()
            .build(self.client.online_manager(), options, None);

        let previous = self.mutation.lock().replace(mutation.clone());
        if let Some(previous) = previous {
            previous.remove_observer(self);
        }
        mutation.add_observer(self);

        let (tx, rx) = oneshot::channel();
        let executing = mutation.clone();
        tokio::spawn(async move {
            let outcome = executing.execute(variables).await;
            let _ = tx.send(outcome);
        });

        MutationJoin { rx }
    }

    /// Detaches from the current mutation and returns to the idle result.
    pub fn reset(self: &Arc<Self>) {
        let previous = self.mutation.lock().take();
        if let Some(previous) = previous {
            previous.remove_observer(self);
        }
        *self.mutate_callbacks.lock() = None;
        self.publish_result();
    }

    /// Reacts to a mutation state transition: refresh the result and fire
    /// per-call callbacks on terminal actions. Per-call callbacks require a
    /// live listener, so an unmounted observer relays nothing.
    pub(crate) fn on_mutation_update(self: &Arc<Self>, action: &MutationAction) {
        self.publish_result();

        if !self.has_listeners() {
            return;
        }
        let callbacks = self.mutate_callbacks.lock().clone();
        let Some(callbacks) = callbacks else {
            return;
        };
        let Some(mutation) = self.mutation.lock().clone() else {
            return;
        };
        let state = mutation.state();
        let Some(variables) = state.variables else {
            return;
        };

        match action {
            MutationAction::Success { data } => {
                if let Some(on_success) = &callbacks.on_success {
                    on_success(data, &variables, state.context.as_ref());
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(Some(data), None, &variables, state.context.as_ref());
                }
            }
            MutationAction::Error { error } => {
                if let Some(on_error) = &callbacks.on_error {
                    on_error(error, &variables, state.context.as_ref());
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(None, Some(error), &variables, state.context.as_ref());
                }
            }
            _ => {}
        }
    }

    fn publish_result(self: &Arc<Self>) {
        let next = self.create_result();
        *self.result.lock() = next.clone();
        self.watch_tx.send_replace(next.clone());

        let observer = self.clone();
        self.client.mutation_notify_manager().schedule(move || {
            observer.listeners.emit(&next);
        });
    }

    fn create_result(self: &Arc<Self>) -> MutationObserverResult {
        let mutation = self.mutation.lock().clone();
        let Some(mutation) = mutation else {
            return idle_result(Arc::downgrade(self));
        };
        let state = mutation.state();
        MutationObserverResult {
            data: state.data,
            error: state.error,
            status: state.status,
            is_idle: state.status == MutationStatus::Idle,
            is_pending: state.status == MutationStatus::Pending,
            is_success: state.status == MutationStatus::Success,
            is_error: state.status == MutationStatus::Error,
            is_paused: state.is_paused,
            failure_count: state.failure_count,
            failure_reason: state.failure_reason,
            variables: state.variables,
            context: state.context,
            submitted_at: state.submitted_at,
            mutate: MutateHandle {
                observer: Arc::downgrade(self),
            },
        }
    }
}

fn idle_result(observer: Weak<MutationObserver>) -> MutationObserverResult {
    MutationObserverResult {
        data: None,
        error: None,
        status: MutationStatus::Idle,
        is_idle: true,
        is_pending: false,
        is_success: false,
        is_error: false,
        is_paused: false,
        failure_count: 0,
        failure_reason: None,
        variables: None,
        context: None,
        submitted_at: None,
        mutate: MutateHandle { observer },
    }
}
