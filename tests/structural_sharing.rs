// Structural sharing across successive results: equal subtrees keep their
// identity, equal wholes keep the previous value outright.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use requery::prelude::*;
use requery::sharing::downcast;
use requery::{FocusManager, OnlineManager};
use serde_json::json;

fn isolated_client() -> QueryClient {
    QueryClient::with_config(QueryClientConfig {
        focus_manager: Some(FocusManager::new()),
        online_manager: Some(OnlineManager::new()),
        ..QueryClientConfig::default()
    })
}

#[derive(PartialEq, Debug)]
struct Todo {
    id: &'static str,
    done: bool,
}

fn todo(id: &'static str, done: bool) -> Arc<Todo> {
    Arc::new(Todo { id, done })
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_items_keep_identity_across_refetches() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    // no sharing configured: the typed query function's default merges
    // element-wise
    let options = || {
        QueryOptions::new(json!(["todos"])).query_fn({
            let calls = calls.clone();
            move |_ctx| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(vec![todo("1", false), todo("2", call > 0)]) }
            }
        })
    };

    let first = client.fetch_query(options()).await.expect("first fetch");
    let second = client.fetch_query(options()).await.expect("second fetch");

    let a = downcast::<Vec<Arc<Todo>>>(&first).expect("typed");
    let b = downcast::<Vec<Arc<Todo>>>(&second).expect("typed");

    assert_eq!(*b[1], Todo { id: "2", done: true });
    assert!(Arc::ptr_eq(&a[0], &b[0]), "unchanged item keeps identity");
    assert!(!Arc::ptr_eq(&a[1], &b[1]), "changed item gets a new identity");
}

#[tokio::test(start_paused = true)]
async fn test_deep_equal_result_keeps_previous_identity() {
    let client = isolated_client();
    let calls = Arc::new(AtomicU32::new(0));

    // the default typed sharing: equal values keep the previous Arc
    let options = || {
        QueryOptions::new(json!(["stable"])).query_fn({
            let calls = calls.clone();
            move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(vec![1u32, 2, 3]) }
            }
        })
    };

    let first = client.fetch_query(options()).await.expect("first fetch");
    let second = client.fetch_query(options()).await.expect("second fetch");

    assert_eq!(calls.load(Ordering::SeqCst), 2, "both fetches ran");
    assert!(
        Arc::ptr_eq(&first, &second),
        "deep-equal replacement is referentially identical"
    );
}

#[tokio::test(start_paused = true)]
async fn test_disabled_sharing_always_replaces() {
    let client = isolated_client();

    let options = || {
        QueryOptions::new(json!(["raw"]))
            .structural_sharing(StructuralSharing::Disabled)
            .query_fn(|_ctx| async move { Ok(vec![1u32, 2, 3]) })
    };

    let first = client.fetch_query(options()).await.expect("first fetch");
    let second = client.fetch_query(options()).await.expect("second fetch");
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn test_set_query_data_applies_sharing() {
    let client = isolated_client();

    let options = QueryOptions::new(json!(["written"]))
        .query_fn(|_ctx| async move { Ok(vec![1u32, 2]) });
    let first = client.fetch_query(options).await.expect("seed");

    // an equal write keeps the cached identity
    let written = client
        .set_query_data(json!(["written"]), vec![1u32, 2])
        .expect("write lands");
    assert!(Arc::ptr_eq(&first, &written));
    tokio::time::sleep(Duration::from_millis(1)).await;

    let cached = client
        .get_query_data::<Vec<u32>>(&json!(["written"]))
        .expect("cached");
    assert_eq!(*cached, vec![1, 2]);
}
