//! Transport-level response cache.
//!
//! Replays successful read responses for a few seconds to absorb bursts of
//! identical calls from collaborators that do not know about each other.
//! Concurrent identical calls are not coalesced here; that is the query
//! executor's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::cache::{ResponseCacheConfig, rw_read, rw_write};

use super::{ApiRequest, ApiResponse, Transport, TransportError};

const SOURCE: &str = "transport::response_cache";

const METRIC_RESPONSE_HIT: &str = "studysync_response_cache_hit_total";
const METRIC_RESPONSE_MISS: &str = "studysync_response_cache_miss_total";

struct TimedResponse {
    response: ApiResponse,
    stored_at: Instant,
}

/// Signature → response map with a single time window and no size cap.
///
/// Every flush bumps a generation; a read that went out before a flush must
/// not land in the cache after it.
pub struct ResponseStore {
    entries: RwLock<HashMap<u64, TimedResponse>>,
    generation: AtomicU64,
    window: Duration,
}

impl ResponseStore {
    pub fn new(config: &ResponseCacheConfig) -> Self {
        Self::with_window(config.window())
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn get(&self, signature: u64) -> Option<ApiResponse> {
        rw_read(&self.entries, SOURCE, "get")
            .get(&signature)
            .filter(|timed| timed.stored_at.elapsed() < self.window)
            .map(|timed| timed.response.clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store `response` unless the cache was flushed after `generation` was
    /// read. Returns whether it was stored.
    pub fn put(&self, signature: u64, response: ApiResponse, generation: u64) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "put");
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(
            signature,
            TimedResponse {
                response,
                stored_at: Instant::now(),
            },
        );
        true
    }

    /// Drop responses outside the window. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "sweep");
        let before = entries.len();
        entries.retain(|_, timed| timed.stored_at.elapsed() < self.window);
        before - entries.len()
    }

    pub fn invalidate_all(&self) {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate_all");
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decorator applied at the single point where outbound calls are issued.
pub struct ResponseCacheLayer<T> {
    inner: T,
    store: Arc<ResponseStore>,
    enabled: bool,
}

impl<T> ResponseCacheLayer<T> {
    pub fn new(inner: T, store: Arc<ResponseStore>, config: &ResponseCacheConfig) -> Self {
        Self {
            inner,
            store,
            enabled: config.enabled,
        }
    }

    pub fn store(&self) -> &Arc<ResponseStore> {
        &self.store
    }
}

#[async_trait]
impl<T: Transport> Transport for ResponseCacheLayer<T> {
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        if !self.enabled {
            return self.inner.send(request).await;
        }

        if !request.is_read() {
            let response = self.inner.send(request).await?;
            // A successful write may change anything a replayed read would show.
            if response.is_success() {
                debug!(cache = "response", "write succeeded, dropping cached responses");
                self.store.invalidate_all();
            }
            return Ok(response);
        }

        let signature = request.signature();
        if let Some(cached) = self.store.get(signature) {
            counter!(METRIC_RESPONSE_HIT).increment(1);
            debug!(cache = "response", outcome = "hit", "replaying cached response");
            return Ok(cached);
        }
        counter!(METRIC_RESPONSE_MISS).increment(1);

        let generation = self.store.generation();
        let response = self.inner.send(request).await?;
        if response.is_success() && !self.store.put(signature, response.clone(), generation) {
            debug!(cache = "response", "read overlapped a write, not caching");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Method;

    use super::*;
    use crate::transport::testing::ScriptedTransport;

    fn layer(transport: Arc<ScriptedTransport>) -> ResponseCacheLayer<Arc<ScriptedTransport>> {
        let config = ResponseCacheConfig::default();
        let store = Arc::new(ResponseStore::new(&config));
        ResponseCacheLayer::new(transport, store, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn identical_reads_within_window_hit_the_network_once() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        let layer = layer(transport.clone());

        for _ in 0..3 {
            let response = layer
                .send(ApiRequest::get("/api/timers"))
                .await
                .expect("response");
            assert_eq!(response.status, 200);
        }

        assert_eq!(transport.calls_to("/api/timers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_expire_after_window() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        let layer = layer(transport.clone());

        layer.send(ApiRequest::get("/api/timers")).await.expect("first");
        tokio::time::advance(Duration::from_secs(5)).await;
        layer.send(ApiRequest::get("/api/timers")).await.expect("second");

        assert_eq!(transport.calls_to("/api/timers"), 2);
        assert_eq!(layer.store().sweep(), 0, "second response is still fresh");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(layer.store().sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue("/api/timers", Ok(ApiResponse::new(500, "boom")));
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        let layer = layer(transport.clone());

        let first = layer.send(ApiRequest::get("/api/timers")).await.expect("first");
        let second = layer.send(ApiRequest::get("/api/timers")).await.expect("second");

        assert_eq!(first.status, 500);
        assert_eq!(second.status, 200);
        assert_eq!(transport.calls_to("/api/timers"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn different_headers_are_different_entries() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/me", Ok(ApiResponse::new(200, "{}")));
        let layer = layer(transport.clone());

        layer.send(ApiRequest::get("/api/me")).await.expect("plain");
        layer
            .send(ApiRequest::get("/api/me").with_header("Accept", "text/plain"))
            .await
            .expect("with header");

        assert_eq!(transport.calls_to("/api/me"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_pass_through_and_flush_on_success() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/friends", Ok(ApiResponse::new(200, "[]")));
        transport.respond("/api/friends/5", Ok(ApiResponse::new(201, "{}")));
        let layer = layer(transport.clone());

        layer.send(ApiRequest::get("/api/friends")).await.expect("read");
        assert_eq!(layer.store().len(), 1);

        for _ in 0..2 {
            layer
                .send(ApiRequest::new(Method::POST, "/api/friends/5"))
                .await
                .expect("write");
        }
        assert_eq!(transport.calls_to("/api/friends/5"), 2);
        assert!(layer.store().is_empty());

        layer.send(ApiRequest::get("/api/friends")).await.expect("re-read");
        assert_eq!(transport.calls_to("/api/friends"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_overlapping_a_write_is_not_cached() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.delay("/api/friends", Duration::from_millis(100));
        transport.respond("/api/friends", Ok(ApiResponse::new(200, "[]")));
        transport.respond("/api/friends/5", Ok(ApiResponse::new(201, "{}")));
        let layer = Arc::new(layer(transport.clone()));

        let read = tokio::spawn({
            let layer = layer.clone();
            async move { layer.send(ApiRequest::get("/api/friends")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        layer
            .send(ApiRequest::new(Method::POST, "/api/friends/5"))
            .await
            .expect("write");

        let response = read.await.expect("read task").expect("read");
        assert_eq!(response.status, 200);
        assert!(layer.store().is_empty());

        layer.send(ApiRequest::get("/api/friends")).await.expect("re-read");
        assert_eq!(transport.calls_to("/api/friends"), 2);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let store = ResponseStore::with_window(Duration::from_secs(5));
        let before = store.generation();
        store.invalidate_all();

        assert!(!store.put(1, ApiResponse::new(200, "old"), before));
        assert!(store.put(1, ApiResponse::new(200, "new"), store.generation()));
        assert_eq!(store.get(1).map(|response| response.text()), Some("new".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_layer_is_transparent() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        let config = ResponseCacheConfig {
            enabled: false,
            ..Default::default()
        };
        let store = Arc::new(ResponseStore::new(&config));
        let layer = ResponseCacheLayer::new(transport.clone(), store, &config);

        layer.send(ApiRequest::get("/api/timers")).await.expect("first");
        layer.send(ApiRequest::get("/api/timers")).await.expect("second");

        assert_eq!(transport.calls_to("/api/timers"), 2);
        assert!(layer.store().is_empty());
    }
}
