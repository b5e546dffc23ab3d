// The dehydrate/hydrate boundary: settled queries transfer, paused
// mutations survive with their variables and resume on the new client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use requery::hydration::{DehydrateOptions, dehydrate, hydrate};
use requery::prelude::*;
use requery::sharing::downcast;
use requery::{FocusManager, OnlineManager};
use serde_json::json;

fn isolated_client_with(online: Arc<OnlineManager>) -> QueryClient {
    QueryClient::with_config(QueryClientConfig {
        focus_manager: Some(FocusManager::new()),
        online_manager: Some(online),
        ..QueryClientConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_successful_queries_transfer() {
    let source = isolated_client_with(OnlineManager::new());
    source.set_query_data(json!(["todo", 1]), "milk".to_string());

    // pending queries are not captured by default
    let _pending = QueryObserver::new(&source, QueryOptions::new(json!(["pending"])))
        .expect("observer builds");

    let snapshot = dehydrate(&source, &DehydrateOptions::default());
    assert_eq!(snapshot.queries.len(), 1);
    assert!(snapshot.mutations.is_empty());

    let target = isolated_client_with(OnlineManager::new());
    hydrate(&target, snapshot);

    let data = target
        .get_query_data::<String>(&json!(["todo", 1]))
        .expect("hydrated");
    assert_eq!(data.as_str(), "milk");
    let state = target.get_query_state(&json!(["todo", 1])).expect("state");
    assert_eq!(state.status, QueryStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_existing_entry_keeps_newer_data() {
    let source = isolated_client_with(OnlineManager::new());
    source.set_query_data(json!(["shared"]), "old".to_string());
    let snapshot = dehydrate(&source, &DehydrateOptions::default());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let target = isolated_client_with(OnlineManager::new());
    target.set_query_data(json!(["shared"]), "newer".to_string());

    hydrate(&target, snapshot);
    let data = target
        .get_query_data::<String>(&json!(["shared"]))
        .expect("cached");
    assert_eq!(data.as_str(), "newer", "older snapshot data does not clobber");
}

#[tokio::test(start_paused = true)]
async fn test_paused_mutation_round_trip_resumes_on_new_client() {
    let online = OnlineManager::new();
    online.set_online(false);
    let source = isolated_client_with(online);

    let source_calls = Arc::new(AtomicU32::new(0));
    let observer = MutationObserver::new(
        &source,
        MutationOptions::new()
            .mutation_key(json!(["add-todo"]))
            .mutation_fn({
                let calls = source_calls.clone();
                move |_variables: Arc<String>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok("done".to_string()) }
                }
            }),
    );
    let _join = observer.mutate("write me down".to_string(), None);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(observer.current_result().is_paused);

    let snapshot = dehydrate(&source, &DehydrateOptions::default());
    assert_eq!(snapshot.mutations.len(), 1);
    let captured = &snapshot.mutations[0];
    assert!(captured.state.is_paused);
    assert_eq!(captured.state.status, MutationStatus::Pending);
    assert!(captured.state.variables.is_some(), "variables survive");

    // the new client supplies the mutation function via key defaults
    let target_online = OnlineManager::new();
    let target = isolated_client_with(target_online.clone());
    let target_calls = Arc::new(AtomicU32::new(0));
    let seen_variables: Arc<std::sync::Mutex<Option<String>>> =
        Arc::new(std::sync::Mutex::new(None));
    target.set_mutation_defaults(
        json!(["add-todo"]),
        MutationOptions::new().mutation_fn({
            let calls = target_calls.clone();
            let seen = seen_variables.clone();
            move |variables: Arc<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock().unwrap() = Some(variables.as_str().to_string());
                async move { Ok("done".to_string()) }
            }
        }),
    );

    hydrate(&target, snapshot);
    target.resume_paused_mutations().await;

    assert_eq!(source_calls.load(Ordering::SeqCst), 0);
    assert_eq!(target_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        seen_variables.lock().unwrap().as_deref(),
        Some("write me down")
    );

    let settled = target
        .mutation_cache()
        .find(&MutationFilters::key(json!(["add-todo"])))
        .expect("hydrated mutation");
    let state = settled.state();
    assert_eq!(state.status, MutationStatus::Success);
    assert!(!state.is_paused);
    assert_eq!(
        state.data.as_ref().and_then(|data| downcast::<String>(data)).as_deref().map(String::as_str),
        Some("done")
    );
}
