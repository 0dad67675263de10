//! End-to-end behaviour of the sync core wired through `SyncContext`.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use studysync::cache::{EventKind, TtlStore};
use studysync::query::{MutationRequest, Payload, UnauthorizedPolicy};
use studysync::session::Validity;
use studysync::transport::testing::ScriptedTransport;
use studysync::transport::{ApiResponse, TransportError};
use studysync::{SyncConfig, SyncContext, SyncError};
use studysync_api_types::CurrentUser;

fn context(api: &Arc<ScriptedTransport>) -> SyncContext {
    SyncContext::new(SyncConfig::default(), api.clone())
}

fn event_kinds(context: &SyncContext) -> Vec<EventKind> {
    context
        .events()
        .drain(usize::MAX)
        .into_iter()
        .map(|event| event.kind)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn store_over_capacity_keeps_the_two_newest_entries() {
    let store = TtlStore::with_limits(
        Duration::from_millis(5000),
        NonZeroUsize::new(2).expect("non-zero"),
    );

    store.set("A", 1, 200);
    tokio::time::advance(Duration::from_millis(10)).await;
    store.set("B", 2, 200);
    tokio::time::advance(Duration::from_millis(10)).await;
    store.set("C", 3, 200);

    assert_eq!(store.keys(), vec!["B".to_string(), "C".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_runs_fetch_once() {
    let api = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(250)));
    api.respond("/x", Ok(ApiResponse::json(200, &json!({"ok": true}))));
    let context = context(&api);
    let descriptor = context.queries().query("/x").enabled_when(true);

    let (first, second) = tokio::join!(
        context.queries().run(&descriptor),
        context.queries().run(&descriptor)
    );

    assert_eq!(api.calls_to("/x"), 1);
    assert_eq!(first.expect("first"), second.expect("second"));
}

#[tokio::test(start_paused = true)]
async fn disabled_query_stays_offline() {
    let api = Arc::new(ScriptedTransport::new());
    let context = context(&api);

    let outcome = context
        .queries()
        .run(&context.queries().query("/api/messages").enabled_when(false))
        .await
        .expect("skipped");

    assert!(outcome.is_skipped());
    assert_eq!(api.calls_to("/api/messages"), 0);
    assert!(context.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_session_emits_one_expiry_and_drops_identity() {
    let api = Arc::new(ScriptedTransport::new());
    api.enqueue(
        "/api/me",
        Ok(ApiResponse::json(200, &json!({"id": 3, "username": "grace"}))),
    );
    api.respond("/api/me", Ok(ApiResponse::new(401, "")));
    let context = context(&api);
    let session = context.session();

    assert_eq!(session.check_authentication(true).await, Validity::Valid);
    assert!(context.store().get("/api/me").is_some());

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(session.check_authentication(true).await, Validity::Invalid);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(session.check_authentication(true).await, Validity::Invalid);

    let expired = event_kinds(&context)
        .into_iter()
        .filter(|kind| *kind == EventKind::SessionExpired)
        .count();
    assert_eq!(expired, 1);
    assert!(context.store().get("/api/me").is_none());
    assert!(session.state().identity.is_none());
    assert_eq!(api.calls_to("/api/me"), 3);
}

#[tokio::test(start_paused = true)]
async fn mutation_forces_refetch_within_stale_time() {
    let api = Arc::new(ScriptedTransport::new());
    api.enqueue("/api/friends", Ok(ApiResponse::json(200, &json!([]))));
    api.respond(
        "/api/friends",
        Ok(ApiResponse::json(200, &json!([{"id": 5}]))),
    );
    api.respond("/friends/5", Ok(ApiResponse::new(204, "")));
    let context = context(&api);
    let friends = context
        .queries()
        .query("/api/friends")
        .stale_time(Duration::from_secs(60));

    context.queries().run(&friends).await.expect("initial read");
    tokio::time::advance(Duration::from_secs(10)).await;

    context
        .mutations()
        .run(&MutationRequest::post("/friends/5").invalidates(["/api/friends"]))
        .await
        .expect("mutation");

    let outcome = context.queries().run(&friends).await.expect("refetch");
    let data = outcome.data().expect("data");
    assert!(!data.from_cache);
    assert_eq!(data.payload, Payload::Json(json!([{"id": 5}])));
    assert_eq!(api.calls_to("/api/friends"), 2);
    assert!(event_kinds(&context).contains(&EventKind::Invalidated {
        key: "/api/friends".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn unreachable_network_is_retried_then_surfaced() {
    let api = Arc::new(ScriptedTransport::new());
    api.respond(
        "/api/timers",
        Err(TransportError::unreachable("/api/timers", "connection refused")),
    );
    let context = context(&api);
    let started = tokio::time::Instant::now();

    let error = context
        .queries()
        .run(&context.queries().query("/api/timers"))
        .await
        .expect_err("offline");

    assert!(matches!(error, SyncError::NetworkUnreachable { .. }));
    assert_eq!(api.calls_to("/api/timers"), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    assert!(context.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn absorbed_unauthorized_reads_resolve_empty() {
    let api = Arc::new(ScriptedTransport::new());
    api.respond("/api/friends/requests", Ok(ApiResponse::new(401, "")));
    let context = context(&api);

    let outcome = context
        .queries()
        .run(
            &context
                .queries()
                .query("/api/friends/requests")
                .on_unauthorized(UnauthorizedPolicy::Absorb),
        )
        .await
        .expect("absorbed");

    assert_eq!(outcome.into_payload(), Some(Payload::Empty));
    let entry = context
        .store()
        .get("/api/friends/requests")
        .expect("absorbed 401 is cached");
    assert_eq!(entry.status_code, 401);
}

#[tokio::test(start_paused = true)]
async fn sign_in_schedules_check_and_sign_out_resets() {
    let api = Arc::new(ScriptedTransport::new());
    api.respond(
        "/api/me",
        Ok(ApiResponse::json(200, &json!({"id": 3, "username": "grace"}))),
    );
    let context = context(&api);
    let user = CurrentUser {
        id: 3,
        username: "grace".to_string(),
        email: None,
        display_name: Some("Grace".to_string()),
        created_at: None,
    };

    let check = context
        .session()
        .identity_established(user)
        .expect("deferred check");
    assert_eq!(check.await.expect("check task"), Validity::Valid);
    assert_eq!(api.calls_to("/api/me"), 1);

    context.sign_out();
    assert_eq!(context.session().validity(), Validity::Unknown);
    assert!(context.store().is_empty());
    assert_eq!(event_kinds(&context).last(), Some(&EventKind::Cleared));
}
