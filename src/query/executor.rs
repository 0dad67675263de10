//! Keyed reads with single-flight deduplication.
//!
//! A run first consults the store, then joins an in-flight fetch for the same
//! key, and only then issues a new fetch. Each fetch is tagged with a flight
//! id; its result is written back only while that flight is still the one
//! registered for the key, so an invalidation that lands mid-flight is never
//! undone by a late response.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, EventKind, EventQueue, TtlStore};
use crate::error::SyncError;
use crate::transport::SharedTransport;

use super::descriptor::{QueryDefaults, QueryDescriptor, UnauthorizedPolicy};
use super::payload::Payload;
use super::retry::with_retry;

const METRIC_QUERY_FETCH: &str = "studysync_query_fetch_total";
const METRIC_QUERY_DEDUP: &str = "studysync_query_dedup_total";
const METRIC_QUERY_FETCH_MS: &str = "studysync_query_fetch_ms";

/// Store holding decoded query results.
pub type QueryStore = TtlStore<Payload>;

type SharedFetch = Shared<BoxFuture<'static, Result<QueryData, SyncError>>>;

/// Result data handed to collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryData {
    pub payload: Payload,
    pub status_code: u16,
    /// Served from the store without network I/O.
    pub from_cache: bool,
}

impl QueryData {
    fn from_entry(entry: CacheEntry<Payload>) -> Self {
        Self {
            payload: entry.payload,
            status_code: entry.status_code,
            from_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// The enabled predicate was false; nothing was read or written.
    Skipped,
    Data(QueryData),
}

impl QueryOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn data(&self) -> Option<&QueryData> {
        match self {
            Self::Data(data) => Some(data),
            Self::Skipped => None,
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Self::Data(data) => Some(data.payload),
            Self::Skipped => None,
        }
    }
}

/// Collaborator view of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    /// Last stored payload, possibly stale.
    pub data: Option<Payload>,
    pub is_loading: bool,
    pub error: Option<SyncError>,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

/// Outcome of a single attempt before it is written back.
struct Resolved {
    data: QueryData,
    cacheable: bool,
}

#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<QueryStore>,
    events: Arc<EventQueue>,
    transport: SharedTransport,
    defaults: QueryDefaults,
    in_flight: Arc<DashMap<String, InFlight>>,
    last_errors: Arc<DashMap<String, SyncError>>,
    next_flight: Arc<AtomicU64>,
}

impl QueryExecutor {
    pub fn new(
        store: Arc<QueryStore>,
        events: Arc<EventQueue>,
        transport: SharedTransport,
        defaults: QueryDefaults,
    ) -> Self {
        Self {
            store,
            events,
            transport,
            defaults,
            in_flight: Arc::new(DashMap::new()),
            last_errors: Arc::new(DashMap::new()),
            next_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    /// A GET descriptor for `path` carrying the configured defaults.
    pub fn query(&self, path: impl Into<String>) -> QueryDescriptor {
        QueryDescriptor::get(self.transport.clone(), path).with_defaults(&self.defaults)
    }

    #[instrument(skip_all, fields(key = %descriptor.key))]
    pub async fn run(&self, descriptor: &QueryDescriptor) -> Result<QueryOutcome, SyncError> {
        if !descriptor.is_enabled() {
            debug!("Query disabled, skipping");
            return Ok(QueryOutcome::Skipped);
        }

        if let Some(entry) = self.fresh_entry(&descriptor.key, descriptor.stale_time) {
            debug!(cache = "store", outcome = "fresh", "Serving cached query result");
            return Ok(QueryOutcome::Data(QueryData::from_entry(entry)));
        }

        self.join_or_start(descriptor)
            .await
            .map(QueryOutcome::Data)
    }

    /// Drop the cached entry for `key` and detach any in-flight fetch so its
    /// completion is not stored. Returns whether a cached entry existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let detached = self.in_flight.remove(key).is_some();
        let removed = self.store.invalidate(key);
        self.last_errors.remove(key);
        debug!(key, removed, detached, "Invalidated query key");
        self.events.publish(EventKind::Invalidated {
            key: key.to_string(),
        });
        removed
    }

    pub fn state(&self, key: &str) -> QueryState {
        QueryState {
            data: self.store.get(key).map(|entry| entry.payload),
            is_loading: self.in_flight.contains_key(key),
            error: self.last_errors.get(key).map(|error| error.value().clone()),
        }
    }

    /// Forget every stored result, in-flight fetch and recorded failure.
    pub fn clear(&self) {
        self.in_flight.clear();
        self.store.clear();
        self.last_errors.clear();
    }

    fn fresh_entry(&self, key: &str, stale_time: Duration) -> Option<CacheEntry<Payload>> {
        self.store
            .get(key)
            .filter(|entry| entry.age() < stale_time)
    }

    fn join_or_start(&self, descriptor: &QueryDescriptor) -> SharedFetch {
        match self.in_flight.entry(descriptor.key.clone()) {
            Entry::Occupied(entry) => {
                counter!(METRIC_QUERY_DEDUP).increment(1);
                debug!("Joining in-flight query");
                entry.get().fetch.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_flight.fetch_add(1, Ordering::SeqCst);
                let fetch = self
                    .clone()
                    .fetch_and_store(descriptor.clone(), id)
                    .boxed()
                    .shared();
                entry.insert(InFlight {
                    id,
                    fetch: fetch.clone(),
                });
                fetch
            }
        }
    }

    async fn fetch_and_store(
        self,
        descriptor: QueryDescriptor,
        flight: u64,
    ) -> Result<QueryData, SyncError> {
        counter!(METRIC_QUERY_FETCH).increment(1);
        let started = Instant::now();
        let result = with_retry(descriptor.retry, &descriptor.key, || {
            self.fetch_once(&descriptor)
        })
        .await;
        histogram!(METRIC_QUERY_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        self.settle(&descriptor, flight, result)
    }

    async fn fetch_once(&self, descriptor: &QueryDescriptor) -> Result<Resolved, SyncError> {
        let response = (descriptor.fetcher)().await?;

        if response.is_success() {
            return Ok(Resolved {
                data: QueryData {
                    payload: Payload::from_response(&response),
                    status_code: response.status,
                    from_cache: false,
                },
                cacheable: true,
            });
        }

        if response.is_unauthorized() {
            let cacheable = match descriptor.unauthorized {
                UnauthorizedPolicy::Absorb => true,
                UnauthorizedPolicy::AbsorbUncached => false,
                UnauthorizedPolicy::Propagate => {
                    return Err(SyncError::Unauthorized {
                        body: response.text(),
                    });
                }
            };
            debug!(cacheable, "Absorbing 401 as an empty result");
            return Ok(Resolved {
                data: QueryData {
                    payload: Payload::Empty,
                    status_code: response.status,
                    from_cache: false,
                },
                cacheable,
            });
        }

        Err(SyncError::server(response.status, response.text()))
    }

    fn settle(
        &self,
        descriptor: &QueryDescriptor,
        flight: u64,
        result: Result<Resolved, SyncError>,
    ) -> Result<QueryData, SyncError> {
        let key = descriptor.key.as_str();
        let mut evicted = Vec::new();

        let current = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().id == flight => {
                // The entry lock is held across the write so an invalidation
                // either precedes it (and detaches us) or follows it.
                if let Some(resolved) = result.as_ref().ok().filter(|resolved| resolved.cacheable) {
                    let ttl = descriptor.retain_time.unwrap_or_else(|| self.store.ttl());
                    evicted = self.store.set_with_ttl(
                        key,
                        resolved.data.payload.clone(),
                        resolved.data.status_code,
                        ttl,
                    );
                }
                entry.remove();
                true
            }
            _ => false,
        };

        if !current {
            debug!(key, "Query was invalidated while in flight; result not stored");
        }

        for evicted_key in evicted {
            self.events.publish(EventKind::Evicted { key: evicted_key });
        }

        match result {
            Ok(resolved) => {
                self.last_errors.remove(key);
                Ok(resolved.data)
            }
            Err(err) => {
                warn!(key, error = %err, "Query failed");
                if current {
                    self.last_errors.insert(key.to_string(), err.clone());
                }
                Err(err)
            }
        }
    }
}
