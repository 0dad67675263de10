use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::SyncError;
use crate::transport::{ApiRequest, Method, SharedTransport, Transport};

use super::executor::QueryExecutor;
use super::payload::Payload;

/// A write and the query keys it makes stale.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub invalidates: Vec<String>,
}

impl MutationRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            invalidates: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn invalidates<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.invalidates.extend(keys.into_iter().map(Into::into));
        self
    }

    fn to_api_request(&self) -> ApiRequest {
        let request = ApiRequest::new(self.method.clone(), self.path.clone());
        match &self.body {
            Some(body) => request.with_json(body.clone()),
            None => request,
        }
    }
}

/// Issues writes straight to the transport: no cache read, no
/// deduplication, no retry.
#[derive(Clone)]
pub struct MutationExecutor {
    transport: SharedTransport,
    queries: QueryExecutor,
}

impl MutationExecutor {
    pub fn new(transport: SharedTransport, queries: QueryExecutor) -> Self {
        Self { transport, queries }
    }

    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn run(&self, request: &MutationRequest) -> Result<Payload, SyncError> {
        let response = self.transport.send(request.to_api_request()).await?;

        if response.is_unauthorized() {
            warn!("Mutation rejected as unauthorized");
            return Err(SyncError::Unauthorized {
                body: response.text(),
            });
        }
        if !response.is_success() {
            let error = SyncError::server(response.status, response.text());
            warn!(status = response.status, reason = %error.message(), "Mutation failed");
            return Err(error);
        }

        for key in &request.invalidates {
            self.queries.invalidate(key);
        }
        info!(
            status = response.status,
            invalidated = request.invalidates.len(),
            "Mutation applied"
        );
        Ok(Payload::from_response(&response))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::{CacheConfig, EventQueue};
    use crate::query::{QueryDefaults, QueryStore, RetryPolicy};
    use crate::transport::ApiResponse;
    use crate::transport::testing::ScriptedTransport;

    fn executors(transport: Arc<ScriptedTransport>) -> (QueryExecutor, MutationExecutor) {
        let queries = QueryExecutor::new(
            Arc::new(QueryStore::new(&CacheConfig::default())),
            Arc::new(EventQueue::new()),
            transport.clone(),
            QueryDefaults::default(),
        );
        let mutations = MutationExecutor::new(transport, queries.clone());
        (queries, mutations)
    }

    #[tokio::test(start_paused = true)]
    async fn success_invalidates_named_keys() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/friends", Ok(ApiResponse::new(200, "[]")));
        transport.respond(
            "/api/friends/5",
            Ok(ApiResponse::json(201, &json!({"status": "pending"}))),
        );
        let (queries, mutations) = executors(transport.clone());
        let friends = queries
            .query("/api/friends")
            .stale_time(Duration::from_secs(60));

        queries.run(&friends).await.expect("initial read");
        tokio::time::advance(Duration::from_secs(10)).await;

        let payload = mutations
            .run(
                &MutationRequest::post("/api/friends/5")
                    .json(json!({"action": "add"}))
                    .invalidates(["/api/friends"]),
            )
            .await
            .expect("mutation");
        assert_eq!(payload, Payload::Json(json!({"status": "pending"})));

        queries.run(&friends).await.expect("refetch");
        assert_eq!(transport.calls_to("/api/friends"), 2);

        let sent = transport
            .requests()
            .into_iter()
            .find(|request| request.path == "/api/friends/5")
            .expect("mutation request");
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.body, Some(json!({"action": "add"})));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_propagate_without_retry_or_invalidation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        transport.respond(
            "/api/timers/3",
            Ok(ApiResponse::json(409, &json!({"error": "timer already running"}))),
        );
        let (queries, mutations) = executors(transport.clone());
        let timers = queries
            .query("/api/timers")
            .stale_time(Duration::from_secs(60))
            .retry(RetryPolicy::default());

        queries.run(&timers).await.expect("initial read");

        let error = mutations
            .run(&MutationRequest::put("/api/timers/3").invalidates(["/api/timers"]))
            .await
            .expect_err("conflict");

        assert_eq!(error.status(), Some(409));
        assert_eq!(error.message(), "timer already running");
        assert_eq!(transport.calls_to("/api/timers/3"), 1);

        queries.run(&timers).await.expect("still cached");
        assert_eq!(transport.calls_to("/api/timers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_text_errors_are_readable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "/api/messages",
            Ok(ApiResponse::new(400, "message body is empty")),
        );
        let (_, mutations) = executors(transport);

        let error = mutations
            .run(&MutationRequest::post("/api/messages").json(json!({"text": ""})))
            .await
            .expect_err("bad request");

        assert_eq!(error.message(), "message body is empty");
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_are_never_deduplicated() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/messages", Ok(ApiResponse::new(201, "")));
        let (_, mutations) = executors(transport.clone());
        let request = MutationRequest::post("/api/messages").json(json!({"text": "hi"}));

        let (first, second) = tokio::join!(mutations.run(&request), mutations.run(&request));

        assert_eq!(first, Ok(Payload::Empty));
        assert_eq!(second, Ok(Payload::Empty));
        assert_eq!(transport.calls_to("/api/messages"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_mutation_is_typed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/friends/5", Ok(ApiResponse::new(401, "")));
        let (_, mutations) = executors(transport);

        let error = mutations
            .run(&MutationRequest::delete("/api/friends/5"))
            .await
            .expect_err("unauthorized");

        assert!(matches!(error, SyncError::Unauthorized { .. }));
    }
}
