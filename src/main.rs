use std::{process, time::Duration};

use clap::Parser;
use futures::future::join_all;
use studysync::{
    SyncContext, SyncError,
    cache::{EventKind, query_key},
    config::{self, CliArgs, Command, GetArgs, LoadError, MutateArgs, SessionArgs},
    infra::{error::InfraError, telemetry},
    query::{MutationRequest, Payload, QueryOutcome, UnauthorizedPolicy},
    session::Validity,
    transport::Method,
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_DRAIN_LIMIT: usize = 64;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("{}", .0.message())]
    Sync(#[from] SyncError),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("session is not valid ({0})")]
    SessionInvalid(Validity),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &CliError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), CliError> {
    let cli = CliArgs::parse();
    let settings = config::load(&cli)?;
    telemetry::init(&settings.logging)?;

    let context = SyncContext::from_settings(&settings)?;

    match cli.command {
        Command::Get(args) => run_get(&context, args).await,
        Command::Mutate(args) => run_mutate(&context, args).await,
        Command::Session(args) => run_session(&context, args).await,
    }
}

async fn run_get(context: &SyncContext, args: GetArgs) -> Result<(), CliError> {
    let params: Vec<(&str, &str)> = args
        .params
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    let key = query_key(&args.path, &params);

    let mut descriptor = context.queries().query(key.as_str());
    if let Some(seconds) = args.stale_seconds {
        descriptor = descriptor.stale_time(Duration::from_secs(seconds));
    }
    if args.absorb_unauthorized {
        descriptor = descriptor.on_unauthorized(UnauthorizedPolicy::Absorb);
    }

    let runs = (0..args.repeat).map(|_| context.queries().run(&descriptor));
    let outcomes = join_all(runs).await;
    info!(key = %key, runs = outcomes.len(), "Reads completed");

    let mut first = None;
    for outcome in outcomes {
        let outcome = outcome?;
        if first.is_none() {
            first = Some(outcome);
        }
    }

    match first {
        Some(QueryOutcome::Data(data)) => {
            info!(
                status = data.status_code,
                from_cache = data.from_cache,
                "Query result"
            );
            println!("{}", render_payload(&data.payload));
        }
        Some(QueryOutcome::Skipped) | None => println!("(skipped)"),
    }
    Ok(())
}

async fn run_mutate(context: &SyncContext, args: MutateArgs) -> Result<(), CliError> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|err| CliError::Input(format!("unknown method `{}`: {err}", args.method)))?;
    if method == Method::GET || method == Method::HEAD {
        return Err(CliError::Input(format!(
            "`{method}` is a read; use `studysync get` instead"
        )));
    }

    let mut request = MutationRequest::new(method, args.path).invalidates(args.invalidate);
    if let Some(body) = args.body.as_deref() {
        let body = serde_json::from_str(body)
            .map_err(|err| CliError::Input(format!("body is not valid JSON: {err}")))?;
        request = request.json(body);
    }

    let payload = context.mutations().run(&request).await?;
    println!("{}", render_payload(&payload));
    Ok(())
}

async fn run_session(context: &SyncContext, args: SessionArgs) -> Result<(), CliError> {
    let validity = context.session().check_authentication(true).await;
    let state = context.session().state();
    match state.identity.as_ref() {
        Some(user) => println!("{validity}: {} (id {})", user.label(), user.id),
        None => println!("{validity}"),
    }

    if !args.watch {
        return match validity {
            Validity::Valid => Ok(()),
            other => Err(CliError::SessionInvalid(other)),
        };
    }

    let tasks = context.spawn_background();
    let mut ticker = tokio::time::interval(EVENT_POLL_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for ctrl-c, stopping watch");
                }
                break;
            }
            _ = ticker.tick() => {
                for event in context.events().drain(EVENT_DRAIN_LIMIT) {
                    if event.kind == EventKind::SessionExpired {
                        println!("session expired, sign in again");
                    } else {
                        info!(event_id = %event.id, kind = ?event.kind, "Sync event");
                    }
                }
            }
        }
    }

    tasks.shutdown().await;
    info!("Session watch stopped");
    Ok(())
}

fn render_payload(payload: &Payload) -> String {
    match payload {
        Payload::Json(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        Payload::Text(text) => text.clone(),
        Payload::Empty => "(empty)".to_string(),
    }
}
