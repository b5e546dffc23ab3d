// Focus and reconnect sweeps: refetch trigger policies and the
// resume-before-refetch ordering on reconnect.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use requery::prelude::*;
use requery::{FocusManager, OnlineManager};
use serde_json::json;

fn isolated_client_with(
    focus: Arc<FocusManager>,
    online: Arc<OnlineManager>,
) -> QueryClient {
    QueryClient::with_config(QueryClientConfig {
        focus_manager: Some(focus),
        online_manager: Some(online),
        ..QueryClientConfig::default()
    })
}

fn counting_options(key: serde_json::Value, calls: Arc<AtomicU32>) -> QueryOptions {
    QueryOptions::new(key)
        .stale_time(Duration::from_secs(3600))
        .query_fn(move |_ctx| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(call) }
        })
}

#[tokio::test(start_paused = true)]
async fn test_focus_always_refetches_fresh_data_but_if_stale_does_not() {
    let focus = FocusManager::new();
    let online = OnlineManager::new();
    let client = isolated_client_with(focus.clone(), online);
    client.mount();

    let stale_calls = Arc::new(AtomicU32::new(0));
    let always_calls = Arc::new(AtomicU32::new(0));

    let if_stale = QueryObserver::new(
        &client,
        counting_options(json!(["if-stale"]), stale_calls.clone())
            .refetch_on_window_focus(RefetchOn::IfStale),
    )
    .expect("observer builds");
    let always = QueryObserver::new(
        &client,
        counting_options(json!(["always"]), always_calls.clone())
            .refetch_on_window_focus(RefetchOn::Always),
    )
    .expect("observer builds");

    if_stale.subscribe(|_| {});
    always.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stale_calls.load(Ordering::SeqCst), 1);
    assert_eq!(always_calls.load(Ordering::SeqCst), 1);

    // both data sets are fresh (one hour stale window)
    focus.set_focused(Some(false));
    focus.set_focused(Some(true));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        stale_calls.load(Ordering::SeqCst),
        1,
        "fresh data does not refetch on focus"
    );
    assert_eq!(
        always_calls.load(Ordering::SeqCst),
        2,
        "'always' refetches regardless of staleness"
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_refetches_stale_queries() {
    let focus = FocusManager::new();
    let online = OnlineManager::new();
    let client = isolated_client_with(focus, online.clone());
    client.mount();

    let calls = Arc::new(AtomicU32::new(0));
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(json!(["reconnect"]))
            .refetch_on_reconnect(RefetchOn::IfStale)
            .query_fn({
                let calls = calls.clone();
                move |_ctx| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(call) }
                }
            }),
    )
    .expect("observer builds");
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // default stale time: immediately stale, so reconnect refetches
    online.set_online(false);
    online.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_paused_mutations_before_refetch_sweep() {
    let focus = FocusManager::new();
    let online = OnlineManager::new();
    let client = isolated_client_with(focus, online.clone());
    client.mount();

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // a query that is stale and will refetch on reconnect
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(json!(["ordering"]))
            .refetch_on_reconnect(RefetchOn::Always)
            .query_fn({
                let events = events.clone();
                move |_ctx| {
                    let events = events.clone();
                    async move {
                        events.lock().unwrap().push("refetch");
                        Ok(0u32)
                    }
                }
            }),
    )
    .expect("observer builds");
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(5)).await;
    events.lock().unwrap().clear();

    // a mutation paused by going offline
    online.set_online(false);
    let mutation = MutationObserver::new(
        &client,
        MutationOptions::new().mutation_fn({
            let events = events.clone();
            move |_variables: Arc<u32>| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push("mutation");
                    Ok(0u32)
                }
            }
        }),
    );
    let join = mutation.mutate(1u32, None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(mutation.current_result().is_paused);

    online.set_online(true);
    let _ = join.await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec!["mutation", "refetch"],
        "paused mutations settle before the reconnect refetch sweep"
    );
}

#[tokio::test(start_paused = true)]
async fn test_paused_fetch_resumes_on_reconnect() {
    let focus = FocusManager::new();
    let online = OnlineManager::new();
    online.set_online(false);
    let client = isolated_client_with(focus, online.clone());
    client.mount();

    let calls = Arc::new(AtomicU32::new(0));
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(json!(["paused-fetch"])).query_fn({
            let calls = calls.clone();
            move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok("online again".to_string()) }
            }
        }),
    )
    .expect("observer builds");
    observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(5)).await;

    let result = observer.current_result();
    assert_eq!(result.fetch_status, FetchStatus::Paused);
    assert!(result.is_paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    online.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = observer.current_result();
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(
        result.data_as::<String>().as_deref().map(String::as_str),
        Some("online again")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
