//! Paginated query data and the page-walking fetch behavior.
//!
//! An infinite query stores [`InfiniteData`]: the fetched pages and the page
//! params that produced them. Its fetch behavior walks pages sequentially —
//! seeding walks forward from `initial_page_param` until the requested page
//! count or until `get_next_page_param` returns `None`; refetches re-fetch
//! every cached page in order, recomputing params as they go; directional
//! fetches append (or prepend) one page and trim to `max_pages` from the far
//! end.

use std::sync::Arc;

use futures::FutureExt;

use crate::error::QueryError;
use crate::options::{QueryFn, QueryFnContext, QueryOptions};
use crate::query::{FetchBehavior, FetchContext, FetchDirection};
use crate::sharing::{SharedData, StructuralSharing, downcast, shared};

/// Computes the param for the page after (or before) the given pages.
/// Arguments: last fetched page, all pages, the param that fetched the last
/// page, all params.
pub type GetPageParam = Arc<
    dyn Fn(&SharedData, &[SharedData], &SharedData, &[SharedData]) -> Option<SharedData>
        + Send
        + Sync,
>;

/// The data shape of an infinite query.
#[derive(Clone, Default)]
pub struct InfiniteData {
    pub pages: Vec<SharedData>,
    pub page_params: Vec<SharedData>,
}

impl InfiniteData {
    #[must_use]
    pub fn pages_as<T: Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.pages.iter().filter_map(downcast::<T>).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

impl std::fmt::Debug for InfiniteData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteData")
            .field("pages", &self.pages.len())
            .field("page_params", &self.page_params.len())
            .finish()
    }
}

/// Typed builder for `get_next_page_param` over page type `P` and param
/// type `N`.
#[must_use]
pub fn next_page_param<P, N>(
    f: impl Fn(&P, &N) -> Option<N> + Send + Sync + 'static,
) -> GetPageParam
where
    P: Send + Sync + 'static,
    N: Send + Sync + 'static,
{
    Arc::new(move |last_page, _all_pages, last_param, _all_params| {
        let page = downcast::<P>(last_page)?;
        let param = downcast::<N>(last_param)?;
        f(&page, &param).map(shared)
    })
}

/// Page-aware structural sharing for [`InfiniteData`].
///
/// Each page is merged with its predecessor at the same index through
/// `page_policy` (the policy the typed per-page query function installs), so
/// a refetch that reproduces a page keeps that page's identity; a walk in
/// which every page survives keeps the previous data outright. The infinite
/// entry points install this automatically.
#[must_use]
pub fn shared_pages(page_policy: StructuralSharing) -> StructuralSharing {
    StructuralSharing::Function(Arc::new(move |previous, next| {
        let Some(prev_data) = previous else {
            return next;
        };
        let (Some(prev), Some(incoming)) = (
            downcast::<InfiniteData>(prev_data),
            downcast::<InfiniteData>(&next),
        ) else {
            return next;
        };

        let mut unchanged = prev.pages.len() == incoming.pages.len();
        let pages: Vec<SharedData> = incoming
            .pages
            .iter()
            .enumerate()
            .map(|(index, page)| {
                let merged = page_policy.merge(prev.pages.get(index), page.clone());
                let reused = prev
                    .pages
                    .get(index)
                    .is_some_and(|old| Arc::ptr_eq(old, &merged));
                if !reused {
                    unchanged = false;
                }
                merged
            })
            .collect();

        if unchanged {
            prev_data.clone()
        } else {
            shared(InfiniteData {
                pages,
                page_params: incoming.page_params.clone(),
            })
        }
    }))
}

/// The fetch behavior installed by the infinite-query entry points.
pub(crate) struct InfiniteQueryBehavior;

impl FetchBehavior for InfiniteQueryBehavior {
    fn on_fetch(&self, context: &mut FetchContext) {
        let options = context.options().clone();
        let query_key = context.query_key().clone();
        let signal = context.signal().clone();
        let direction = context.meta().and_then(|meta| meta.direction);
        let existing = context
            .state()
            .data
            .as_ref()
            .and_then(downcast::<InfiniteData>);

        context.set_fetch_fn(move || {
            let options = options.clone();
            let query_key = query_key.clone();
            let signal = signal.clone();
            let existing = existing.clone();
            async move { walk_pages(&options, &query_key, &signal, existing, direction).await }
                .boxed()
        });
    }
}

async fn walk_pages(
    options: &QueryOptions,
    query_key: &serde_json::Value,
    signal: &crate::retry::AbortSignal,
    existing: Option<Arc<InfiniteData>>,
    direction: Option<FetchDirection>,
) -> Result<SharedData, QueryError> {
    let Some(QueryFn::Run(query_fn)) = options.query_fn.clone() else {
        return Err(QueryError::MissingQueryFn(Arc::from(
            crate::key::hash_query_key(query_key),
        )));
    };

    let fetch_page = |param: SharedData| {
        let context = QueryFnContext::new(
            query_key.clone(),
            options.meta.clone(),
            Some(param),
            signal.clone(),
        );
        query_fn(context)
    };

    let next_param = |pages: &[SharedData], params: &[SharedData]| -> Option<SharedData> {
        let (Some(last_page), Some(last_param)) = (pages.last(), params.last()) else {
            return None;
        };
        options
            .get_next_page_param
            .as_ref()
            .and_then(|get_next| get_next(last_page, pages, last_param, params))
    };

    let previous_param = |pages: &[SharedData], params: &[SharedData]| -> Option<SharedData> {
        let (Some(first_page), Some(first_param)) = (pages.first(), params.first()) else {
            return None;
        };
        options
            .get_previous_page_param
            .as_ref()
            .and_then(|get_previous| get_previous(first_page, pages, first_param, params))
    };

    match (existing, direction) {
        // directional fetch: append or prepend one page
        (Some(old), Some(direction)) if !old.pages.is_empty() => {
            let mut pages = old.pages.clone();
            let mut page_params = old.page_params.clone();

            let param = match direction {
                FetchDirection::Forward => next_param(&pages, &page_params),
                FetchDirection::Backward => previous_param(&pages, &page_params),
            };
            let Some(param) = param else {
                return Ok(shared(InfiniteData {
                    pages,
                    page_params,
                }));
            };

            let page = fetch_page(param.clone()).await?;
            match direction {
                FetchDirection::Forward => {
                    pages.push(page);
                    page_params.push(param);
                }
                FetchDirection::Backward => {
                    pages.insert(0, page);
                    page_params.insert(0, param);
                }
            }

            if let Some(max_pages) = options.max_pages {
                while pages.len() > max_pages {
                    match direction {
                        FetchDirection::Forward => {
                            pages.remove(0);
                            page_params.remove(0);
                        }
                        FetchDirection::Backward => {
                            pages.pop();
                            page_params.pop();
                        }
                    }
                }
            }

            Ok(shared(InfiniteData { pages, page_params }))
        }

        // refetch: walk every cached page in order
        (Some(old), None) if !old.pages.is_empty() => {
            let mut pages = Vec::with_capacity(old.pages.len());
            let mut page_params = Vec::with_capacity(old.page_params.len());

            let mut param = old
                .page_params
                .first()
                .cloned()
                .or_else(|| options.initial_page_param.clone());
            for _ in 0..old.pages.len() {
                let Some(current) = param else {
                    break;
                };
                let page = fetch_page(current.clone()).await?;
                pages.push(page);
                page_params.push(current);
                param = next_param(&pages, &page_params);
            }

            Ok(shared(InfiniteData { pages, page_params }))
        }

        // seed: walk forward until the requested count or until params dry up
        _ => {
            let goal = options.pages.unwrap_or(1).max(1);
            let Some(first) = options.initial_page_param.clone() else {
                return Err(QueryError::message(
                    "infinite query requires an initial page param",
                ));
            };

            let mut pages = Vec::new();
            let mut page_params = Vec::new();
            let mut param = Some(first);
            while pages.len() < goal {
                let Some(current) = param else {
                    break;
                };
                let page = fetch_page(current.clone()).await?;
                pages.push(page);
                page_params.push(current);
                param = next_param(&pages, &page_params);
            }

            Ok(shared(InfiniteData { pages, page_params }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_page_param_typed() {
        let get_next = next_page_param::<Vec<u32>, u32>(|page, param| {
            if page.is_empty() { None } else { Some(param + 1) }
        });

        let pages = vec![shared(vec![1u32, 2, 3])];
        let params = vec![shared(0u32)];
        let next = get_next(&pages[0], &pages, &params[0], &params);
        assert_eq!(next.and_then(|p| downcast::<u32>(&p)).as_deref(), Some(&1));

        let pages = vec![shared(Vec::<u32>::new())];
        let next = get_next(&pages[0], &pages, &params[0], &params);
        assert!(next.is_none());
    }

    #[test]
    fn test_shared_pages_reuses_unchanged_pages() {
        let sharing = shared_pages(StructuralSharing::replace_equal::<Vec<u32>>());

        let first = sharing.merge(
            None,
            shared(InfiniteData {
                pages: vec![shared(vec![1u32, 2]), shared(vec![3u32, 4])],
                page_params: vec![shared(0u32), shared(1u32)],
            }),
        );
        let second = sharing.merge(
            Some(&first),
            shared(InfiniteData {
                pages: vec![shared(vec![1u32, 2]), shared(vec![3u32, 5])],
                page_params: vec![shared(0u32), shared(1u32)],
            }),
        );

        let a = downcast::<InfiniteData>(&first).expect("typed");
        let b = downcast::<InfiniteData>(&second).expect("typed");
        assert!(Arc::ptr_eq(&a.pages[0], &b.pages[0]), "equal page keeps identity");
        assert!(!Arc::ptr_eq(&a.pages[1], &b.pages[1]));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_shared_pages_identical_walk_keeps_data_identity() {
        let sharing = shared_pages(StructuralSharing::replace_equal::<Vec<u32>>());

        let first = sharing.merge(
            None,
            shared(InfiniteData {
                pages: vec![shared(vec![1u32, 2]), shared(vec![3u32, 4])],
                page_params: vec![shared(0u32), shared(1u32)],
            }),
        );
        let second = sharing.merge(
            Some(&first),
            shared(InfiniteData {
                pages: vec![shared(vec![1u32, 2]), shared(vec![3u32, 4])],
                page_params: vec![shared(0u32), shared(1u32)],
            }),
        );
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_infinite_data_typed_pages() {
        let data = InfiniteData {
            pages: vec![shared(vec![1u32]), shared(vec![2u32, 3])],
            page_params: vec![shared(0u32), shared(1u32)],
        };
        assert_eq!(data.len(), 2);
        let typed = data.pages_as::<Vec<u32>>();
        assert_eq!(*typed[1], vec![2, 3]);
    }
}
