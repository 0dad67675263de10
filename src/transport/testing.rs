//! Scripted in-memory transport for tests.
//!
//! Enabled for this crate's unit tests and, through the `testing` feature,
//! for integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::cache::mutex_lock;

const SOURCE: &str = "transport::testing";

type Reply = Result<ApiResponse, TransportError>;

#[derive(Default)]
struct Route {
    queued: VecDeque<Reply>,
    fallback: Option<Reply>,
    latency: Option<Duration>,
}

/// In-memory transport answering from per-path scripts.
///
/// Queued replies are used once in order; afterwards the fallback reply is
/// repeated. Unscripted paths answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<ApiRequest>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reply takes `latency` unless its path has its own delay.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn respond(&self, path: &str, reply: Reply) {
        self.route(path, |route| route.fallback = Some(reply));
    }

    pub fn enqueue(&self, path: &str, reply: Reply) {
        self.route(path, |route| route.queued.push_back(reply));
    }

    /// Latency for replies on `path` only.
    pub fn delay(&self, path: &str, latency: Duration) {
        self.route(path, |route| route.latency = Some(latency));
    }

    pub fn calls_to(&self, path: &str) -> usize {
        mutex_lock(&self.calls, SOURCE, "calls_to")
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        mutex_lock(&self.calls, SOURCE, "requests").clone()
    }

    fn route(&self, path: &str, edit: impl FnOnce(&mut Route)) {
        let mut routes = mutex_lock(&self.routes, SOURCE, "route");
        edit(routes.entry(path.to_string()).or_default());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        mutex_lock(&self.calls, SOURCE, "send").push(request.clone());
        let (reply, latency) = {
            let mut routes = mutex_lock(&self.routes, SOURCE, "send");
            match routes.get_mut(&request.path) {
                Some(route) => (
                    route
                        .queued
                        .pop_front()
                        .or_else(|| route.fallback.clone())
                        .unwrap_or_else(|| Ok(ApiResponse::new(404, "not scripted"))),
                    route.latency.unwrap_or(self.latency),
                ),
                None => (Ok(ApiResponse::new(404, "not scripted")), self.latency),
            }
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        reply
    }
}
