//! Bounded retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use metrics::counter;
use tracing::warn;

use crate::error::SyncError;

const METRIC_QUERY_RETRY: &str = "studysync_query_retry_total";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// How often, and how patiently, a transient failure is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Doubling backoff from `base_delay`, capped at `max_delay`, without
    /// jitter. The attempt count bounds retries, not elapsed time.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(BACKOFF_MULTIPLIER)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delays slept before each retry, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (0..self.max_retries)
            .map_while(|_| backoff.next_backoff())
            .collect()
    }

    /// Total time spent sleeping if every retry is used.
    pub fn total_budget(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    key: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }
        let Some(delay) = backoff.next_backoff() else {
            return Err(err);
        };

        attempt += 1;
        counter!(METRIC_QUERY_RETRY).increment(1);
        warn!(
            key,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}
