use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "studysync_store_hit_total",
            Unit::Count,
            "Total number of TTL store hits."
        );
        describe_counter!(
            "studysync_store_miss_total",
            Unit::Count,
            "Total number of TTL store misses, expired entries included."
        );
        describe_counter!(
            "studysync_store_evict_total",
            Unit::Count,
            "Total number of TTL store evictions due to capacity."
        );
        describe_counter!(
            "studysync_store_expired_total",
            Unit::Count,
            "Total number of expired entries removed by the sweep."
        );
        describe_counter!(
            "studysync_response_cache_hit_total",
            Unit::Count,
            "Total number of transport response-cache hits."
        );
        describe_counter!(
            "studysync_response_cache_miss_total",
            Unit::Count,
            "Total number of transport response-cache misses."
        );
        describe_counter!(
            "studysync_query_fetch_total",
            Unit::Count,
            "Total number of query fetches started."
        );
        describe_counter!(
            "studysync_query_retry_total",
            Unit::Count,
            "Total number of query retries after transient failures."
        );
        describe_counter!(
            "studysync_query_dedup_total",
            Unit::Count,
            "Total number of runs that joined an in-flight fetch."
        );
        describe_histogram!(
            "studysync_query_fetch_ms",
            Unit::Milliseconds,
            "Query fetch latency in milliseconds, retries included."
        );
        describe_counter!(
            "studysync_session_check_total",
            Unit::Count,
            "Total number of identity round-trips."
        );
        describe_counter!(
            "studysync_session_expired_total",
            Unit::Count,
            "Total number of sessions the server stopped accepting."
        );
        describe_gauge!(
            "studysync_event_queue_len",
            Unit::Count,
            "Current number of pending sync events in the queue."
        );
        describe_counter!(
            "studysync_event_dropped_total",
            Unit::Count,
            "Total number of sync events dropped due to queue overflow."
        );
    });
}
