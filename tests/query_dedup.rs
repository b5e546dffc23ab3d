// One fetch per query: concurrent callers share the in-flight promise.
// Also covers gc windows for observer-less entries and the
// consumed-abort-token cancellation rule.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

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

fn slow_counting_options(key: serde_json::Value, calls: Arc<AtomicU32>) -> QueryOptions {
    QueryOptions::new(key).query_fn(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("value".to_string())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_execution() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
        client.fetch_query_as::<String>(slow_counting_options(json!(["dedup"]), calls.clone())),
        client.fetch_query_as::<String>(slow_counting_options(json!(["dedup"]), calls.clone())),
    );

    let a = a.expect("first caller");
    let b = b.expect("second caller");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one fetch served both");
    assert!(Arc::ptr_eq(&a, &b), "both callers see the same value");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_observers_share_the_promise() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let first =
        QueryObserver::new(&client, slow_counting_options(json!(["shared"]), calls.clone()))
            .expect("observer builds");
    let second =
        QueryObserver::new(&client, slow_counting_options(json!(["shared"]), calls.clone()))
            .expect("observer builds");

    first.subscribe(|_| {});
    second.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    let promise_a = first.current_result().promise.expect("in-flight promise");
    let promise_b = second.current_result().promise.expect("in-flight promise");
    assert!(promise_a.ptr_eq(&promise_b), "one promise shared by observers");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.current_result().data_as::<String>(),
        second.current_result().data_as::<String>()
    );
}

#[tokio::test(start_paused = true)]
async fn test_observerless_query_collects_after_gc_time() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let options = slow_counting_options(json!(["short-lived"]), calls.clone())
        .gc_time(Duration::from_millis(100));
    let _ = client.fetch_query(options).await.expect("seed");
    assert!(client.get_query_data_erased(&json!(["short-lived"])).is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        client.get_query_data_erased(&json!(["short-lived"])).is_none(),
        "entry collected after its gc window"
    );
}

#[tokio::test(start_paused = true)]
async fn test_gc_never_keeps_entry_forever() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let options =
        slow_counting_options(json!(["pinned"]), calls.clone()).gc_time(GcTime::Never);
    let _ = client.fetch_query(options).await.expect("seed");

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(
        client.get_query_data_erased(&json!(["pinned"])).is_some(),
        "gc disabled: the entry survives indefinitely"
    );
}

#[tokio::test(start_paused = true)]
async fn test_observed_query_survives_gc_window() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    let options = slow_counting_options(json!(["watched"]), calls.clone())
        .gc_time(Duration::from_millis(50));
    let observer = QueryObserver::new(&client, options).expect("observer builds");
    let id = observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.get_query_data_erased(&json!(["watched"])).is_some());

    // last unsubscribe starts the countdown
    observer.unsubscribe(id);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.get_query_data_erased(&json!(["watched"])).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unconsumed_fetch_completes_after_last_unsubscribe() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    // the query function never touches its abort token
    let options = slow_counting_options(json!(["keep-alive"]), calls.clone())
        .gc_time(Duration::from_secs(3600));
    let observer = QueryObserver::new(&client, options).expect("observer builds");
    let id = observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(1)).await;
    observer.unsubscribe(id);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        client
            .get_query_data::<String>(&json!(["keep-alive"]))
            .as_deref()
            .map(String::as_str),
        Some("value"),
        "fetch ran to completion to populate the cache"
    );
}

#[tokio::test(start_paused = true)]
async fn test_consumed_fetch_cancels_and_reverts_on_last_unsubscribe() {
    let client = isolated_client();
    let started = Arc::new(AtomicU32::new(0));
    let signal_slot: Arc<std::sync::Mutex<Option<requery::retry::AbortSignal>>> =
        Arc::new(std::sync::Mutex::new(None));

    let options = QueryOptions::new(json!(["abortable"]))
        .gc_time(Duration::from_secs(3600))
        .query_fn({
            let started = started.clone();
            let signal_slot = signal_slot.clone();
            move |ctx| {
                started.fetch_add(1, Ordering::SeqCst);
                // taking the token marks this fetch abort-aware
                *signal_slot.lock().unwrap() = Some(ctx.signal());
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("late".to_string())
                }
            }
        });
    let observer = QueryObserver::new(&client, options).expect("observer builds");
    let id = observer.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    observer.unsubscribe(id);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let signal = signal_slot.lock().unwrap().clone().expect("token captured");
    assert!(signal.is_aborted(), "abort token signalled");

    let state = client.get_query_state(&json!(["abortable"])).expect("query exists");
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.status, QueryStatus::Pending, "reverted to pre-fetch state");
    assert!(state.data.is_none());
    assert!(state.error.is_none());
}
