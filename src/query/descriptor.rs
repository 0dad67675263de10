use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::transport::{ApiRequest, ApiResponse, SharedTransport, Transport, TransportError};

use super::retry::RetryPolicy;

/// Produces a raw response for a query, or a transport failure.
pub type Fetcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ApiResponse, TransportError>> + Send + Sync>;

/// Decides at run time whether a query executes at all.
pub type EnabledPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// What a query does with a 401 response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnauthorizedPolicy {
    /// Resolve to an empty payload and cache it.
    Absorb,
    /// Resolve to an empty payload without caching it.
    AbsorbUncached,
    /// Surface `SyncError::Unauthorized`.
    #[default]
    Propagate,
}

/// Per-query settings that apply when a descriptor does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDefaults {
    pub stale_time: Duration,
    /// `None` means the store's own TTL.
    pub retain_time: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            retain_time: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::QuerySettings> for QueryDefaults {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            stale_time: settings.stale_time,
            retain_time: settings.retain_time,
            retry: RetryPolicy::new(
                settings.max_retries,
                settings.retry_base_delay,
                settings.retry_max_delay,
            ),
        }
    }
}

/// A keyed read: what to fetch, when to skip it, and how long its result
/// stays fresh.
#[derive(Clone)]
pub struct QueryDescriptor {
    pub key: String,
    pub fetcher: Fetcher,
    pub enabled: Option<EnabledPredicate>,
    pub stale_time: Duration,
    pub retain_time: Option<Duration>,
    pub retry: RetryPolicy,
    pub unauthorized: UnauthorizedPolicy,
}

impl QueryDescriptor {
    pub fn new<F>(key: impl Into<String>, fetcher: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<ApiResponse, TransportError>> + Send + Sync + 'static,
    {
        let defaults = QueryDefaults::default();
        Self {
            key: key.into(),
            fetcher: Arc::new(fetcher),
            enabled: None,
            stale_time: defaults.stale_time,
            retain_time: defaults.retain_time,
            retry: defaults.retry,
            unauthorized: UnauthorizedPolicy::default(),
        }
    }

    /// A GET of `path` through `transport`, keyed by the path itself.
    pub fn get(transport: SharedTransport, path: impl Into<String>) -> Self {
        let path = path.into();
        let target = path.clone();
        Self::new(path, move || {
            let transport = transport.clone();
            let request = ApiRequest::get(target.clone());
            async move { transport.send(request).await }.boxed()
        })
    }

    pub fn enabled<P>(mut self, predicate: P) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(predicate));
        self
    }

    pub fn enabled_when(self, enabled: bool) -> Self {
        self.enabled(move || enabled)
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn retain_time(mut self, retain_time: Duration) -> Self {
        self.retain_time = Some(retain_time);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_unauthorized(mut self, policy: UnauthorizedPolicy) -> Self {
        self.unauthorized = policy;
        self
    }

    pub fn with_defaults(mut self, defaults: &QueryDefaults) -> Self {
        self.stale_time = defaults.stale_time;
        self.retain_time = defaults.retain_time;
        self.retry = defaults.retry;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.as_ref().is_none_or(|predicate| predicate())
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("enabled", &self.enabled.is_some())
            .field("stale_time", &self.stale_time)
            .field("retain_time", &self.retain_time)
            .field("retry", &self.retry)
            .field("unauthorized", &self.unauthorized)
            .finish_non_exhaustive()
    }
}
