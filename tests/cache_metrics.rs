use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use studysync::cache::{EventKind, EventQueue, TtlStore};
use studysync::query::RetryPolicy;
use studysync::transport::ApiResponse;
use studysync::transport::testing::ScriptedTransport;
use studysync::{SyncConfig, SyncContext};

#[tokio::test(start_paused = true)]
async fn sync_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Store hit/miss/evict/expire
    let store = TtlStore::with_limits(
        Duration::from_millis(500),
        NonZeroUsize::new(1).expect("non-zero"),
    );
    assert!(store.get("/api/a").is_none());
    store.set("/api/a", 1_u8, 200);
    assert!(store.get("/api/a").is_some());
    store.set("/api/b", 2_u8, 200);
    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(store.sweep(), 1);

    // Event queue length + drop metrics
    let queue = EventQueue::new_with_limit(NonZeroUsize::new(1).expect("non-zero"));
    queue.publish(EventKind::Cleared);
    queue.publish(EventKind::SessionExpired);
    let _ = queue.drain(1);

    // Query fetch, dedup, retry and response cache through the context
    let api = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(50)));
    api.enqueue("/api/friends", Ok(ApiResponse::new(503, "busy")));
    api.respond("/api/friends", Ok(ApiResponse::json(200, &json!([]))));
    api.enqueue(
        "/api/me",
        Ok(ApiResponse::json(200, &json!({"id": 1, "username": "ada"}))),
    );
    api.respond("/api/me", Ok(ApiResponse::new(401, "")));
    let context = SyncContext::new(SyncConfig::default(), api.clone());

    let friends = context
        .queries()
        .query("/api/friends")
        .retry(RetryPolicy::new(
            2,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
    let (first, second) = tokio::join!(
        context.queries().run(&friends),
        context.queries().run(&friends)
    );
    first.expect("first read");
    second.expect("joined read");

    context.queries().invalidate("/api/friends");
    context.queries().run(&friends).await.expect("response cache hit");

    // Session check + expiry
    context.session().check_authentication(true).await;
    tokio::time::advance(Duration::from_secs(6)).await;
    context.session().check_authentication(true).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "studysync_store_hit_total",
        "studysync_store_miss_total",
        "studysync_store_evict_total",
        "studysync_store_expired_total",
        "studysync_event_queue_len",
        "studysync_event_dropped_total",
        "studysync_query_fetch_total",
        "studysync_query_dedup_total",
        "studysync_query_retry_total",
        "studysync_query_fetch_ms",
        "studysync_response_cache_hit_total",
        "studysync_response_cache_miss_total",
        "studysync_session_check_total",
        "studysync_session_expired_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
