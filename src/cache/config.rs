//! Cache configuration.
//!
//! Controls the bounded TTL store and the transport-level response cache.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_RESPONSE_WINDOW_MS: u64 = 5 * 1000;
const DEFAULT_RESPONSE_SWEEP_INTERVAL_MS: u64 = 10 * 1000;

/// Bounded TTL store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default time-to-live of a stored entry.
    pub ttl_ms: u64,
    /// Maximum number of entries kept after a trim.
    pub max_entries: usize,
    /// Interval of the background garbage-collection sweep.
    pub sweep_interval_ms: u64,
    /// Maximum pending events before the oldest are dropped.
    pub event_queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl_ms: duration_ms(settings.ttl),
            max_entries: settings.max_entries.get(),
            sweep_interval_ms: duration_ms(settings.sweep_interval),
            event_queue_limit: settings.event_queue_limit.get(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Sweep interval, never shorter than one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Returns the event queue limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Transport-level response cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    pub enabled: bool,
    /// How long a successful read response is replayed.
    pub window_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: DEFAULT_RESPONSE_WINDOW_MS,
            sweep_interval_ms: DEFAULT_RESPONSE_SWEEP_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::ResponseCacheSettings> for ResponseCacheConfig {
    fn from(settings: &crate::config::ResponseCacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            window_ms: duration_ms(settings.window),
            sweep_interval_ms: duration_ms(settings.sweep_interval),
        }
    }
}

impl ResponseCacheConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
