//! Shared data values and structural sharing.
//!
//! Cache entries hold type-erased values so heterogeneous queries can live
//! in one cache; reference identity is `Arc` pointer identity. Structural
//! sharing decides, on every successful resolution, how much of the previous
//! value survives into the next one: when a replacement is equal to what the
//! cache already holds, subscribers keep seeing the exact same `Arc`, and
//! when only part of it changed, the unchanged parts keep their identity.
//!
//! The default merge for typed results walks values via [`ReplaceEqual`]:
//! scalars and opaque values compare whole, vectors merge element-wise
//! (reusing equal elements from the predecessor, which preserves the `Arc`
//! identity of `Vec<Arc<T>>` entries), and types can implement the trait to
//! walk deeper.

use std::any::Any;
use std::sync::Arc;

/// A type-erased cache value.
pub type SharedData = Arc<dyn Any + Send + Sync>;

/// Wraps a value for storage in the cache.
#[must_use]
pub fn shared<T: Send + Sync + 'static>(value: T) -> SharedData {
    Arc::new(value)
}

/// Recovers a typed value from a cache value.
#[must_use]
pub fn downcast<T: Send + Sync + 'static>(data: &SharedData) -> Option<Arc<T>> {
    data.clone().downcast::<T>().ok()
}

/// Merging a replacement with its predecessor while preserving the identity
/// of whatever did not change.
///
/// The default keeps the previous `Arc` when the replacement compares equal.
/// The crate implements the trait for the primitive types, strings,
/// `serde_json::Value`, `Arc<T>`, `Option<T>` and `Vec<T>`; the vector
/// implementation merges element-wise, so a list that changes in one place
/// keeps the identity of every other element. Value types used directly as
/// query data opt in with an empty impl:
///
/// ```rust,ignore
/// #[derive(PartialEq)]
/// struct Todo {
///     id: String,
///     done: bool,
/// }
///
/// impl ReplaceEqual for Todo {}
/// ```
pub trait ReplaceEqual: PartialEq + Send + Sync + Sized + 'static {
    /// Merges `next` with its predecessor, returning the value to present.
    fn replace_equal(previous: &Arc<Self>, next: Arc<Self>) -> Arc<Self> {
        if previous.as_ref() == next.as_ref() {
            previous.clone()
        } else {
            next
        }
    }
}

macro_rules! replace_equal_by_value {
    ($($ty:ty),* $(,)?) => {
        $(impl ReplaceEqual for $ty {})*
    };
}

replace_equal_by_value!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    serde_json::Value,
);

impl<T: PartialEq + Send + Sync + 'static> ReplaceEqual for Arc<T> {}

impl<T: ReplaceEqual> ReplaceEqual for Option<T> {}

impl<T: ReplaceEqual + Clone> ReplaceEqual for Vec<T> {
    fn replace_equal(previous: &Arc<Self>, next: Arc<Self>) -> Arc<Self> {
        if previous.as_ref() == next.as_ref() {
            return previous.clone();
        }
        let merged: Vec<T> = next
            .iter()
            .enumerate()
            .map(|(index, item)| match previous.get(index) {
                Some(old) if old == item => old.clone(),
                _ => item.clone(),
            })
            .collect();
        Arc::new(merged)
    }
}

type SharingFn = Arc<dyn Fn(Option<&SharedData>, SharedData) -> SharedData + Send + Sync>;

/// Policy merging a freshly produced value with the previous one.
#[derive(Clone)]
pub enum StructuralSharing {
    /// Raw replacement: every resolution produces a new identity.
    Disabled,
    /// Custom merge of `(previous, next)`.
    Function(SharingFn),
}

impl StructuralSharing {
    /// The default policy for typed results: a deep merge via
    /// [`ReplaceEqual`].
    #[must_use]
    pub fn replace_equal<T: ReplaceEqual>() -> Self {
        Self::Function(Arc::new(|previous, next| {
            let Some(previous) = previous else {
                return next;
            };
            let (Some(old), Some(new)) = (downcast::<T>(previous), downcast::<T>(&next)) else {
                return next;
            };
            let merged = T::replace_equal(&old, new);
            if Arc::ptr_eq(&merged, &old) {
                previous.clone()
            } else {
                let data: SharedData = merged;
                data
            }
        }))
    }

    /// Keeps the previous `Arc<T>` whenever the next value compares equal,
    /// without walking into it.
    #[must_use]
    pub fn keep_equal<T: PartialEq + Send + Sync + 'static>() -> Self {
        Self::Function(Arc::new(|previous, next| {
            let Some(previous) = previous else {
                return next;
            };
            match (downcast::<T>(previous), downcast::<T>(&next)) {
                (Some(a), Some(b)) if a == b => previous.clone(),
                _ => next,
            }
        }))
    }

    /// Element-wise sharing for `Vec<Arc<T>>` results: items equal to their
    /// predecessor at the same index keep the predecessor's `Arc`, and a
    /// fully equal vector keeps its previous identity outright.
    #[must_use]
    pub fn shared_vec<T: PartialEq + Send + Sync + 'static>() -> Self {
        Self::Function(Arc::new(|previous, next| {
            let Some(prev_data) = previous else {
                return next;
            };
            let (Some(prev), Some(items)) = (
                downcast::<Vec<Arc<T>>>(prev_data),
                downcast::<Vec<Arc<T>>>(&next),
            ) else {
                return next;
            };

            let mut unchanged = prev.len() == items.len();
            let merged: Vec<Arc<T>> = items
                .iter()
                .enumerate()
                .map(|(index, item)| match prev.get(index) {
                    Some(old) if old.as_ref() == item.as_ref() => old.clone(),
                    _ => {
                        unchanged = false;
                        item.clone()
                    }
                })
                .collect();

            if unchanged {
                prev_data.clone()
            } else {
                shared(merged)
            }
        }))
    }

    pub(crate) fn merge(&self, previous: Option<&SharedData>, next: SharedData) -> SharedData {
        match self {
            Self::Disabled => next,
            Self::Function(f) => f(previous, next),
        }
    }
}

impl std::fmt::Debug for StructuralSharing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("StructuralSharing::Disabled"),
            Self::Function(_) => f.write_str("StructuralSharing::Function"),
        }
    }
}
