//! # Requery - Asynchronous State-Cache Engine
//!
//! Requery maintains a keyed cache of in-flight and completed asynchronous
//! operations. Observers subscribe to individual cache entries and receive
//! derived results; the engine coordinates deduplication, retries with
//! backoff, cancellation, staleness-driven refetching, offline pausing, and
//! a secondary cache of resumable mutations.
//!
//! ## Core Components
//!
//! 1. **[`query::Query`]**: one cache entry with a reducer-driven state machine
//! 2. **[`query_cache::QueryCache`]**: the keyed map of queries, with filters and events
//! 3. **[`query_observer::QueryObserver`]**: the per-subscriber view deriving observable results
//! 4. **[`mutation::Mutation`] / [`mutation_cache::MutationCache`]**: the parallel
//!    pipeline for one-shot side effects with pause/resume and scope serialization
//! 5. **[`retry`]**: the pause- and cancel-capable retry loop under both
//! 6. **[`client::QueryClient`]**: the facade composing caches, defaults and commands
//!
//! External signals enter through the ambient [`focus::FocusManager`] and
//! [`online::OnlineManager`]; each query's [`retry::NetworkMode`] decides
//! whether a fetch runs, pauses, or always proceeds.
//!
//! ## Example
//!
//! ```rust,ignore
//! use requery::prelude::*;
//! use serde_json::json;
//!
//! let client = QueryClient::new();
//! client.mount();
//!
//! // imperative fetch with dedup and freshness checks
//! let todos = client
//!     .fetch_query_as::<Vec<Todo>>(
//!         QueryOptions::new(json!(["todos"]))
//!             .query_fn(|_ctx| async move { fetch_todos().await }),
//!     )
//!     .await?;
//!
//! // or subscribe to the entry and react to every change
//! let observer = QueryObserver::new(
//!     &client,
//!     QueryOptions::new(json!(["todos"]))
//!         .query_fn(|_ctx| async move { fetch_todos().await }),
//! )?;
//! observer.subscribe(|result| {
//!     if let Some(todos) = result.data_as::<Vec<Todo>>() {
//!         render(&todos);
//!     }
//! });
//! ```
//!
//! All timers run on the tokio clock, so tests drive staleness, collection
//! and retry delays deterministically with a paused runtime.

pub mod client;
pub mod error;
pub mod focus;
pub mod gc;
pub mod hydration;
pub mod infinite;
pub mod key;
mod listeners;
pub mod mutation;
pub mod mutation_cache;
pub mod mutation_observer;
pub mod notify;
pub mod online;
pub mod options;
pub mod prelude;
pub mod query;
pub mod query_cache;
pub mod query_observer;
pub mod retry;
pub mod sharing;

// Re-export commonly used types
pub use client::{
    EnsureOptions, InvalidateOptions, QueryClient, QueryClientConfig, RefetchOptions, RefetchType,
};
pub use error::{CancelOptions, QueryError};
pub use focus::{FocusManager, focus_manager};
pub use gc::GcTime;
pub use infinite::{InfiniteData, shared_pages};
pub use key::{QueryKey, hash_query_key};
pub use mutation::MutationStatus;
pub use mutation_cache::{MutationCache, MutationFilters};
pub use mutation_observer::{MutateCallbacks, MutationObserver, MutationObserverResult};
pub use online::{OnlineManager, online_manager};
pub use options::{
    MutationOptions, PlaceholderData, QueryFn, QueryFnContext, QueryOptions, RefetchOn, StaleTime,
    keep_previous_data, skip_token,
};
pub use query::{FetchStatus, Query, QueryStatus};
pub use query_cache::{QueryCache, QueryFilters, QueryTypeFilter};
pub use query_observer::{QueryObserver, QueryObserverResult};
pub use retry::{NetworkMode, RetryDelay, RetryPolicy};
pub use sharing::{ReplaceEqual, SharedData, StructuralSharing, downcast, shared};
