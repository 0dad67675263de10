//! Session validity monitor.
//!
//! Confirms the locally assumed session against the identity endpoint. At
//! most one round-trip runs at a time, unforced checks are throttled, and a
//! session the server stops accepting is reported exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use studysync_api_types::CurrentUser;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{EventKind, EventQueue, mutex_lock};
use crate::error::SyncError;
use crate::query::{Payload, QueryExecutor};
use crate::transport::{ApiRequest, ApiResponse, SharedTransport, Transport};

use super::state::{SessionConfig, SessionState, Validity};

const SOURCE: &str = "session::monitor";

const METRIC_SESSION_CHECK: &str = "studysync_session_check_total";
const METRIC_SESSION_EXPIRED: &str = "studysync_session_expired_total";

/// Holds the `checking` flag for the duration of one round-trip.
struct CheckGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CheckGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What a round-trip told us.
struct Observation {
    validity: Validity,
    identity: Option<CurrentUser>,
    /// Identity payload to cache under the identity key.
    payload: Option<Payload>,
}

impl Observation {
    fn invalid() -> Self {
        Self {
            validity: Validity::Invalid,
            identity: None,
            payload: None,
        }
    }
}

pub struct SessionMonitor {
    transport: SharedTransport,
    queries: QueryExecutor,
    events: Arc<EventQueue>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    checking: AtomicBool,
    /// Bumped by `sign_out` while the state lock is held.
    generation: AtomicU64,
}

impl SessionMonitor {
    pub fn new(
        transport: SharedTransport,
        queries: QueryExecutor,
        events: Arc<EventQueue>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            queries,
            events,
            config,
            state: Mutex::new(SessionState::default()),
            checking: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        let mut snapshot = mutex_lock(&self.state, SOURCE, "state").clone();
        snapshot.is_checking = self.checking.load(Ordering::Acquire);
        snapshot
    }

    pub fn validity(&self) -> Validity {
        mutex_lock(&self.state, SOURCE, "validity").validity
    }

    /// Confirm the session with the server.
    ///
    /// Returns the last known validity without I/O when a check is already
    /// running, or when `force` is false and the last round-trip is younger
    /// than the throttle window.
    #[instrument(skip(self))]
    pub async fn check_authentication(&self, force: bool) -> Validity {
        let Some(_guard) = CheckGuard::acquire(&self.checking) else {
            debug!("Session check already running, returning last known validity");
            return self.validity();
        };

        if !force {
            let state = mutex_lock(&self.state, SOURCE, "throttle");
            let throttled = state
                .last_validated_at
                .is_some_and(|last| last.elapsed() < self.config.throttle_window);
            if throttled {
                debug!(validity = %state.validity, "Session check throttled");
                return state.validity;
            }
        }

        counter!(METRIC_SESSION_CHECK).increment(1);
        let generation = self.generation.load(Ordering::Acquire);
        let observation = match self
            .transport
            .send(ApiRequest::get(self.config.identity_path.as_str()))
            .await
        {
            Ok(response) => Self::observe(&response),
            Err(err) => {
                warn!(error = %err, "Identity endpoint unreachable, treating session as invalid");
                Observation::invalid()
            }
        };
        self.apply(generation, observation)
    }

    /// Record an identity learned outside the monitor (sign-in).
    ///
    /// The first time an identity becomes known a check is scheduled after
    /// the initial delay; its handle is returned.
    pub fn identity_established(
        self: &Arc<Self>,
        user: CurrentUser,
    ) -> Option<JoinHandle<Validity>> {
        let first = {
            let mut state = mutex_lock(&self.state, SOURCE, "identity_established");
            let first = state.identity.is_none();
            state.identity = Some(user.clone());
            state.validity = Validity::Valid;
            state.last_mismatch = None;
            first
        };

        match serde_json::to_value(&user) {
            Ok(value) => self.cache_identity(Payload::Json(value)),
            Err(err) => warn!(error = %err, "Failed to encode identity for the cache"),
        }

        if !first {
            return None;
        }

        info!(user = %user.label(), "Identity established, scheduling session check");
        let monitor = Arc::clone(self);
        let delay = self.config.initial_check_delay;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            monitor.check_authentication(true).await
        }))
    }

    /// Run a forced check every revalidate interval until aborted.
    pub fn spawn_revalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = self.config.revalidate_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let validity = monitor.check_authentication(true).await;
                debug!(%validity, "Periodic session revalidation finished");
            }
        })
    }

    /// Forget everything known about the session.
    ///
    /// A check still in flight is detached: its result is discarded.
    pub fn sign_out(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "sign_out");
        *state = SessionState::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(state);
        info!("Session reset to unknown");
    }

    fn observe(response: &ApiResponse) -> Observation {
        if response.is_success() {
            let payload = Payload::from_response(response);
            let identity = match payload.decode::<CurrentUser>() {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!(error = %err, "Identity payload did not decode; session stays valid");
                    None
                }
            };
            return Observation {
                validity: Validity::Valid,
                identity,
                payload: Some(payload),
            };
        }

        if response.is_unauthorized() {
            debug!("Identity endpoint rejected the session");
        } else {
            warn!(
                status = response.status,
                "Identity endpoint failed, treating session as invalid"
            );
        }
        Observation::invalid()
    }

    fn apply(&self, generation: u64, observation: Observation) -> Validity {
        let expired_user = {
            let mut state = mutex_lock(&self.state, SOURCE, "apply");
            if self.generation.load(Ordering::Acquire) != generation {
                debug!("Session was reset during the check, discarding its result");
                return state.validity;
            }
            state.last_validated_at = Some(Instant::now());

            match observation.validity {
                Validity::Valid => {
                    if let Some(payload) = observation.payload {
                        self.cache_identity(payload);
                    }
                    if observation.identity.is_some() {
                        state.identity = observation.identity;
                    }
                    state.validity = Validity::Valid;
                    None
                }
                _ => {
                    let was_authenticated = state.is_authenticated();
                    let previous = state.identity.take();
                    state.validity = Validity::Invalid;
                    if was_authenticated {
                        let mismatch = SyncError::session_mismatch(format!(
                            "server rejected the session of {}",
                            previous.as_ref().map_or("an unknown user", |user| user.label())
                        ));
                        state.last_mismatch = Some(mismatch.clone());
                        Some(mismatch)
                    } else {
                        None
                    }
                }
            }
        };

        let validity = observation.validity;
        if validity != Validity::Valid {
            match expired_user {
                Some(mismatch) => {
                    self.queries.invalidate(&self.config.identity_key);
                    counter!(METRIC_SESSION_EXPIRED).increment(1);
                    warn!(error = %mismatch, "Session expired");
                    self.events.publish(EventKind::SessionExpired);
                }
                None => {
                    self.queries.store().invalidate(&self.config.identity_key);
                }
            }
        }
        validity
    }

    fn cache_identity(&self, payload: Payload) {
        let evicted = self
            .queries
            .store()
            .set(self.config.identity_key.as_str(), payload, 200);
        for key in evicted {
            self.events.publish(EventKind::Evicted { key });
        }
    }
}
