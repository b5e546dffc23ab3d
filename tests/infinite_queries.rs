// Page walking for infinite queries: seeding multiple pages, early stop on
// an exhausted cursor, and refetching every cached page.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use requery::infinite::next_page_param;
use requery::prelude::*;
use requery::{FocusManager, OnlineManager};
use serde_json::json;

fn isolated_client() -> QueryClient {
    QueryClient::with_config(QueryClientConfig {
        focus_manager: Some(FocusManager::new()),
        online_manager: Some(OnlineManager::new()),
        ..QueryClientConfig::default()
    })
}

/// Pages of three items each, ending after item 8 (three full pages).
fn paged_backend(calls: Arc<AtomicU32>) -> QueryOptions {
    let mut options = QueryOptions::new(json!(["items"])).query_fn(move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let start = ctx.page_param_as::<u32>().map_or(0, |param| *param);
        async move {
            let page: Vec<u32> = (start..(start + 3).min(9)).collect();
            Ok(page)
        }
    });
    options.initial_page_param = Some(requery::shared(0u32));
    options.get_next_page_param = Some(next_page_param::<Vec<u32>, u32>(|page, param| {
        let next = param + 3;
        if page.len() < 3 || next >= 9 { None } else { Some(next) }
    }));
    options
}

#[tokio::test(start_paused = true)]
async fn test_fetch_infinite_query_walks_requested_pages() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let mut options = paged_backend(calls.clone());
    options.pages = Some(2);

    let data = client
        .fetch_infinite_query(options)
        .await
        .expect("pages fetched");
    assert_eq!(data.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let pages = data.pages_as::<Vec<u32>>();
    assert_eq!(*pages[0], vec![0, 1, 2]);
    assert_eq!(*pages[1], vec![3, 4, 5]);

    let params: Vec<u32> = data
        .page_params
        .iter()
        .filter_map(|param| requery::downcast::<u32>(param).map(|p| *p))
        .collect();
    assert_eq!(params, vec![0, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_page_walk_stops_when_cursor_runs_out() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let mut options = paged_backend(calls.clone());
    options.pages = Some(10);

    let data = client
        .fetch_infinite_query(options)
        .await
        .expect("pages fetched");
    assert_eq!(data.len(), 3, "stops early once get_next_page_param yields None");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_walks_all_cached_pages() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let mut options = paged_backend(calls.clone());
    options.pages = Some(3);
    let _ = client
        .fetch_infinite_query(options)
        .await
        .expect("seeded");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // a second fetch on stale data re-fetches every cached page in order
    let mut options = paged_backend(calls.clone());
    options.pages = Some(3);
    let data = client
        .fetch_infinite_query(options)
        .await
        .expect("refetched");
    assert_eq!(data.len(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_preserves_identity_of_unchanged_pages() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));
    let generation = Arc::new(AtomicU32::new(0));

    // pages start at 0, 3 and 6; only the middle page's content moves with
    // the generation counter
    let backend = |calls: Arc<AtomicU32>, generation: Arc<AtomicU32>| {
        let mut options = QueryOptions::new(json!(["feed"])).query_fn(move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let start = ctx.page_param_as::<u32>().map_or(0, |param| *param);
            let generation = generation.load(Ordering::SeqCst);
            async move {
                let page: Vec<u32> = if start == 3 {
                    vec![3 + generation, 4 + generation, 5 + generation]
                } else {
                    (start..start + 3).collect()
                };
                Ok(page)
            }
        });
        options.initial_page_param = Some(requery::shared(0u32));
        options.get_next_page_param = Some(next_page_param::<Vec<u32>, u32>(|_page, param| {
            if param + 3 >= 9 { None } else { Some(param + 3) }
        }));
        options.pages = Some(3);
        options
    };

    let first = client
        .fetch_infinite_query(backend(calls.clone(), generation.clone()))
        .await
        .expect("seeded");

    generation.fetch_add(1, Ordering::SeqCst);
    let second = client
        .fetch_infinite_query(backend(calls.clone(), generation.clone()))
        .await
        .expect("refetched");

    assert_eq!(calls.load(Ordering::SeqCst), 6, "every page was re-fetched");
    assert!(
        Arc::ptr_eq(&first.pages[0], &second.pages[0]),
        "unchanged page keeps its identity across the refetch"
    );
    assert!(
        !Arc::ptr_eq(&first.pages[1], &second.pages[1]),
        "the changed page gets a new identity"
    );
    assert!(
        Arc::ptr_eq(&first.pages[2], &second.pages[2]),
        "pages after the changed one are unaffected"
    );
    assert_eq!(
        *second.pages_as::<Vec<u32>>()[1],
        vec![4, 5, 6],
        "the changed page carries the new content"
    );
}

#[tokio::test(start_paused = true)]
async fn test_refetch_with_identical_pages_keeps_data_identity() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let mut options = paged_backend(calls.clone());
    options.pages = Some(3);
    let first = client
        .fetch_infinite_query(options)
        .await
        .expect("seeded");

    let mut options = paged_backend(calls.clone());
    options.pages = Some(3);
    let second = client
        .fetch_infinite_query(options)
        .await
        .expect("refetched");

    assert_eq!(calls.load(Ordering::SeqCst), 6, "the refetch really ran");
    assert!(
        Arc::ptr_eq(&first, &second),
        "a walk reproducing every page keeps the previous data outright"
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_initial_page_param_is_an_error() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let mut options = paged_backend(calls.clone());
    options.initial_page_param = None;
    options.retry = Some(requery::RetryPolicy::Count(0));

    let outcome = client.fetch_infinite_query(options).await;
    assert!(outcome.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
