//! Prelude module for convenient imports.
//!
//! ```
//! use requery::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The cache facade
//! - [`QueryOptions`] / [`MutationOptions`] - Configuration builders
//! - [`QueryObserver`] / [`MutationObserver`] - Subscriptions
//! - [`QueryFilters`] - Bulk-command targeting
//! - The status enums and common sentinels

pub use crate::client::{
    EnsureOptions, InvalidateOptions, QueryClient, QueryClientConfig, RefetchOptions, RefetchType,
};
pub use crate::error::{CancelOptions, QueryError};
pub use crate::gc::GcTime;
pub use crate::infinite::InfiniteData;
pub use crate::key::QueryKey;
pub use crate::mutation::MutationStatus;
pub use crate::mutation_cache::MutationFilters;
pub use crate::mutation_observer::{MutateCallbacks, MutationObserver, MutationObserverResult};
pub use crate::options::{
    MutationOptions, PlaceholderData, QueryOptions, RefetchOn, StaleTime, keep_previous_data,
    skip_token,
};
pub use crate::query::{FetchStatus, QueryStatus};
pub use crate::query_cache::{QueryFilters, QueryTypeFilter};
pub use crate::query_observer::{QueryObserver, QueryObserverResult};
pub use crate::retry::{NetworkMode, RetryDelay, RetryPolicy};
pub use crate::sharing::{ReplaceEqual, SharedData, StructuralSharing, downcast, shared};
