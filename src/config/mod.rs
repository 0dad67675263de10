//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, GetArgs, GlobalOverrides, MutateArgs, SessionArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "studysync";
const ENV_PREFIX: &str = "STUDYSYNC";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_QUERY_STALE_TIME_MS: u64 = 0;
const DEFAULT_QUERY_MAX_RETRIES: u32 = 3;
const DEFAULT_QUERY_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_QUERY_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RESPONSE_CACHE_WINDOW_MS: u64 = 5000;
const DEFAULT_RESPONSE_CACHE_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_IDENTITY_PATH: &str = "/api/me";
const DEFAULT_SESSION_THROTTLE_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_SESSION_REVALIDATE_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_SESSION_INITIAL_CHECK_DELAY_MS: u64 = 1000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api: ApiSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub query: QuerySettings,
    pub response_cache: ResponseCacheSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_entries: NonZeroUsize,
    pub sweep_interval: Duration,
    pub event_queue_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub stale_time: Duration,
    /// `None` keeps entries for the cache TTL.
    pub retain_time: Option<Duration>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ResponseCacheSettings {
    pub enabled: bool,
    pub window: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub identity_path: String,
    pub throttle_window: Duration,
    pub revalidate_interval: Duration,
    pub initial_check_delay: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    api: RawApiSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    query: RawQuerySettings,
    response_cache: RawResponseCacheSettings,
    session: RawSessionSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.api.request_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            api,
            logging,
            cache,
            query,
            response_cache,
            session,
        } = raw;

        Ok(Self {
            api: build_api_settings(api)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            query: build_query_settings(query)?,
            response_cache: build_response_cache_settings(response_cache)?,
            session: build_session_settings(session)?,
        })
    }
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("api.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "api.base_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = api
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "api.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ApiSettings {
        base_url,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = positive_secs(
        cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.ttl_seconds",
    )?;
    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let sweep_interval = positive_secs(
        cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_SECS),
        "cache.sweep_interval_seconds",
    )?;
    let event_queue_limit = non_zero_usize(
        cache.event_queue_limit.unwrap_or(DEFAULT_EVENT_QUEUE_LIMIT),
        "cache.event_queue_limit",
    )?;

    Ok(CacheSettings {
        ttl,
        max_entries,
        sweep_interval,
        event_queue_limit,
    })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let stale_time = Duration::from_millis(
        query
            .stale_time_ms
            .unwrap_or(DEFAULT_QUERY_STALE_TIME_MS),
    );
    let retain_time = query
        .retain_time_seconds
        .map(|seconds| positive_secs(seconds, "query.retain_time_seconds"))
        .transpose()?;

    let retry_base_delay = Duration::from_millis(
        query
            .retry_base_delay_ms
            .unwrap_or(DEFAULT_QUERY_RETRY_BASE_DELAY_MS),
    );
    let retry_max_delay = Duration::from_millis(
        query
            .retry_max_delay_ms
            .unwrap_or(DEFAULT_QUERY_RETRY_MAX_DELAY_MS),
    );
    if retry_max_delay < retry_base_delay {
        return Err(LoadError::invalid(
            "query.retry_max_delay_ms",
            "must not be smaller than query.retry_base_delay_ms",
        ));
    }

    Ok(QuerySettings {
        stale_time,
        retain_time,
        max_retries: query.max_retries.unwrap_or(DEFAULT_QUERY_MAX_RETRIES),
        retry_base_delay,
        retry_max_delay,
    })
}

fn build_response_cache_settings(
    response_cache: RawResponseCacheSettings,
) -> Result<ResponseCacheSettings, LoadError> {
    let window_ms = response_cache
        .window_ms
        .unwrap_or(DEFAULT_RESPONSE_CACHE_WINDOW_MS);
    if window_ms == 0 {
        return Err(LoadError::invalid(
            "response_cache.window_ms",
            "must be greater than zero; disable the cache with response_cache.enabled",
        ));
    }
    let sweep_interval = positive_secs(
        response_cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_RESPONSE_CACHE_SWEEP_INTERVAL_SECS),
        "response_cache.sweep_interval_seconds",
    )?;

    Ok(ResponseCacheSettings {
        enabled: response_cache.enabled.unwrap_or(true),
        window: Duration::from_millis(window_ms),
        sweep_interval,
    })
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let identity_path = session
        .identity_path
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_IDENTITY_PATH.to_string());
    if !identity_path.starts_with('/') {
        return Err(LoadError::invalid(
            "session.identity_path",
            "path must start with `/`",
        ));
    }

    let throttle_window = Duration::from_secs(
        session
            .throttle_window_seconds
            .unwrap_or(DEFAULT_SESSION_THROTTLE_WINDOW_SECS),
    );
    let revalidate_interval = positive_secs(
        session
            .revalidate_interval_seconds
            .unwrap_or(DEFAULT_SESSION_REVALIDATE_INTERVAL_SECS),
        "session.revalidate_interval_seconds",
    )?;
    let initial_check_delay = Duration::from_millis(
        session
            .initial_check_delay_ms
            .unwrap_or(DEFAULT_SESSION_INITIAL_CHECK_DELAY_MS),
    );

    Ok(SessionSettings {
        identity_path,
        throttle_window,
        revalidate_interval,
        initial_check_delay,
    })
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_seconds: Option<u64>,
    max_entries: Option<usize>,
    sweep_interval_seconds: Option<u64>,
    event_queue_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    stale_time_ms: Option<u64>,
    retain_time_seconds: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResponseCacheSettings {
    enabled: Option<bool>,
    window_ms: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    identity_path: Option<String>,
    throttle_window_seconds: Option<u64>,
    revalidate_interval_seconds: Option<u64>,
    initial_check_delay_ms: Option<u64>,
}
