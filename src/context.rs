//! Wiring of the sync core.
//!
//! [`SyncContext`] builds one store, one event queue, the executors and the
//! session monitor around a single transport, and owns their background
//! tasks. Nothing here is global: tests and the binary each build their own.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheConfig, EventKind, EventQueue, ResponseCacheConfig};
use crate::config::Settings;
use crate::infra::error::InfraError;
use crate::query::{MutationExecutor, QueryDefaults, QueryExecutor, QueryStore};
use crate::session::{SessionConfig, SessionMonitor};
use crate::transport::{
    ReqwestTransport, ResponseCacheLayer, ResponseStore, SharedTransport, Transport,
};

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub response_cache: ResponseCacheConfig,
    pub query: QueryDefaults,
    pub session: SessionConfig,
}

impl From<&Settings> for SyncConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            cache: CacheConfig::from(&settings.cache),
            response_cache: ResponseCacheConfig::from(&settings.response_cache),
            query: QueryDefaults::from(&settings.query),
            session: SessionConfig::from(&settings.session),
        }
    }
}

pub struct SyncContext {
    config: SyncConfig,
    transport: SharedTransport,
    responses: Arc<ResponseStore>,
    store: Arc<QueryStore>,
    events: Arc<EventQueue>,
    queries: QueryExecutor,
    mutations: MutationExecutor,
    session: Arc<SessionMonitor>,
}

impl SyncContext {
    /// Build the core around `transport`, wrapping it in the response cache.
    pub fn new<T>(config: SyncConfig, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        let responses = Arc::new(ResponseStore::new(&config.response_cache));
        let transport: SharedTransport = Arc::new(ResponseCacheLayer::new(
            transport,
            responses.clone(),
            &config.response_cache,
        ));
        let events = Arc::new(EventQueue::new_with_limit(
            config.cache.event_queue_limit_non_zero(),
        ));
        let store = Arc::new(QueryStore::new(&config.cache));
        let queries = QueryExecutor::new(
            store.clone(),
            events.clone(),
            transport.clone(),
            config.query,
        );
        let mutations = MutationExecutor::new(transport.clone(), queries.clone());
        let session = Arc::new(SessionMonitor::new(
            transport.clone(),
            queries.clone(),
            events.clone(),
            config.session.clone(),
        ));

        Self {
            config,
            transport,
            responses,
            store,
            events,
            queries,
            mutations,
            session,
        }
    }

    /// Build the core against the configured HTTP API.
    pub fn from_settings(settings: &Settings) -> Result<Self, InfraError> {
        let transport = ReqwestTransport::new(&settings.api)?;
        info!(base_url = %transport.base_url(), "HTTP transport ready");
        Ok(Self::new(SyncConfig::from(settings), transport))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The response-cached transport every component sends through.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn responses(&self) -> &Arc<ResponseStore> {
        &self.responses
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn queries(&self) -> &QueryExecutor {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationExecutor {
        &self.mutations
    }

    pub fn session(&self) -> &Arc<SessionMonitor> {
        &self.session
    }

    /// Start the store sweep, the response-cache sweep and session
    /// revalidation.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = Vec::with_capacity(3);

        let store = self.store.clone();
        handles.push(spawn_sweep(
            "store",
            self.config.cache.sweep_interval(),
            move || store.sweep(),
        ));

        if self.config.response_cache.enabled {
            let responses = self.responses.clone();
            handles.push(spawn_sweep(
                "response",
                self.config.response_cache.sweep_interval(),
                move || responses.sweep(),
            ));
        }

        handles.push(self.session.spawn_revalidation());

        info!(tasks = handles.len(), "Background sync tasks started");
        BackgroundTasks { handles }
    }

    /// Drop every cached value and forget the session.
    pub fn sign_out(&self) {
        self.session.sign_out();
        self.queries.clear();
        self.responses.invalidate_all();
        self.events.publish(EventKind::Cleared);
        info!("Signed out, sync caches cleared");
    }
}

fn spawn_sweep<F>(cache: &'static str, period: Duration, sweep: F) -> JoinHandle<()>
where
    F: Fn() -> usize + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = sweep();
            if removed > 0 {
                debug!(cache, removed, "Sweep removed expired entries");
            }
        }
    })
}

/// Handles of the background tasks started by [`SyncContext::spawn_background`].
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task and wait for it to finish.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        debug!("Background sync tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query::{MutationRequest, Payload};
    use crate::session::Validity;
    use crate::transport::ApiResponse;
    use crate::transport::testing::ScriptedTransport;

    #[tokio::test(start_paused = true)]
    async fn reads_share_the_response_cache() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("/api/timers", Ok(ApiResponse::new(200, "[]")));
        let context = SyncContext::new(SyncConfig::default(), transport.clone());
        let timers = context.queries().query("/api/timers");

        context.queries().run(&timers).await.expect("first");
        context.queries().run(&timers).await.expect("second");

        assert_eq!(transport.calls_to("/api/timers"), 1);
        assert_eq!(context.responses().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_clears_everything() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "/api/me",
            Ok(ApiResponse::json(200, &json!({"id": 1, "username": "ada"}))),
        );
        let context = SyncContext::new(SyncConfig::default(), transport);

        assert_eq!(
            context.session().check_authentication(true).await,
            Validity::Valid
        );
        assert!(!context.store().is_empty());
        assert!(!context.responses().is_empty());

        context.sign_out();

        assert!(context.store().is_empty());
        assert!(context.responses().is_empty());
        assert_eq!(context.session().validity(), Validity::Unknown);
        let kinds: Vec<EventKind> = context
            .events()
            .drain(usize::MAX)
            .into_iter()
            .map(|event| event.kind)
            .collect();
        assert_eq!(kinds.last(), Some(&EventKind::Cleared));
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_a_slow_read_is_seen_by_the_next_read() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.delay("/api/friends", Duration::from_millis(100));
        transport.enqueue("/api/friends", Ok(ApiResponse::json(200, &json!("old"))));
        transport.respond("/api/friends", Ok(ApiResponse::json(200, &json!("new"))));
        transport.respond("/api/friends/5", Ok(ApiResponse::new(204, "")));
        let context = SyncContext::new(SyncConfig::default(), transport.clone());

        let read = {
            let queries = context.queries().clone();
            tokio::spawn(async move {
                let friends = queries.query("/api/friends");
                queries.run(&friends).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        context
            .mutations()
            .run(&MutationRequest::post("/api/friends/5").invalidates(["/api/friends"]))
            .await
            .expect("write");
        read.await.expect("read task").expect("slow read");

        let friends = context.queries().query("/api/friends");
        let payload = context
            .queries()
            .run(&friends)
            .await
            .expect("read after write")
            .into_payload();
        assert_eq!(payload, Some(Payload::Json(json!("new"))));
        assert_eq!(transport.calls_to("/api/friends"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_outlives_a_pending_session_check() {
        let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_millis(200)));
        transport.respond(
            "/api/me",
            Ok(ApiResponse::json(200, &json!({"id": 1, "username": "ada"}))),
        );
        let context = SyncContext::new(SyncConfig::default(), transport);

        let check = {
            let session = Arc::clone(context.session());
            tokio::spawn(async move { session.check_authentication(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        context.sign_out();
        check.await.expect("check task");

        assert_eq!(context.session().validity(), Validity::Unknown);
        assert!(context.session().state().identity.is_none());
        assert!(context.store().get("/api/me").is_none());
        assert!(context.responses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeps_reclaim_expired_entries() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = SyncConfig {
            cache: CacheConfig {
                ttl_ms: 1000,
                sweep_interval_ms: 5000,
                ..CacheConfig::default()
            },
            ..SyncConfig::default()
        };
        let context = SyncContext::new(config, transport);
        context.store().set("/api/search?q=rust", Payload::Empty, 200);

        let tasks = context.spawn_background();
        assert_eq!(tasks.len(), 3);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(context.store().len(), 1, "sweep has not run yet");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(context.store().is_empty());

        tasks.shutdown().await;
    }
}
