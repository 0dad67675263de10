use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the studysync binary.
#[derive(Debug, Parser)]
#[command(
    name = "studysync",
    version,
    about = "Data-synchronization client for the study platform API"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STUDYSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Read a path through the query executor.
    Get(GetArgs),
    /// Send a write and invalidate the keys it makes stale.
    Mutate(MutateArgs),
    /// Check the session against the identity endpoint.
    Session(SessionArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the API base URL.
    #[arg(long = "api-base-url", value_name = "URL", global = true)]
    pub api_base_url: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS", global = true)]
    pub request_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    /// API path, e.g. `/api/friends`.
    #[arg(value_name = "PATH")]
    pub path: String,

    /// Query parameter as `name=value`; may be repeated.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Issue the read this many times concurrently.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    /// Serve cached results younger than this many seconds.
    #[arg(long = "stale-seconds", value_name = "SECONDS")]
    pub stale_seconds: Option<u64>,

    /// Resolve a 401 to an empty result instead of failing.
    #[arg(long = "absorb-unauthorized", action = clap::ArgAction::SetTrue)]
    pub absorb_unauthorized: bool,
}

#[derive(Debug, Args, Clone)]
pub struct MutateArgs {
    /// HTTP method (POST, PUT, PATCH or DELETE).
    #[arg(value_name = "METHOD")]
    pub method: String,

    /// API path, e.g. `/api/friends/5`.
    #[arg(value_name = "PATH")]
    pub path: String,

    /// JSON request body.
    #[arg(long, value_name = "JSON")]
    pub body: Option<String>,

    /// Query key to invalidate on success; may be repeated.
    #[arg(long = "invalidate", value_name = "KEY")]
    pub invalidate: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SessionArgs {
    /// Keep running and revalidate on the configured interval.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub watch: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}
