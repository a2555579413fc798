use std::io::{self, Write};
use std::process;

use icebreak::{
    cache::{CacheConfig, CachePolicy, FetchError, PolicyPreset, QueryClient},
    config::{self, LoadError, PoliciesArgs, SimulateArgs},
    infra::{error::InfraError, telemetry},
    simulate::{self, SimulationPlan},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("simulation aborted: {0}")]
    Simulation(#[from] FetchError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Policies(PoliciesArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Policies(args) => run_policies(&settings.cache, &args),
        config::Command::Simulate(args) => run_simulate(&settings.cache, &args).await,
    }
}

#[derive(Debug, Serialize)]
struct PolicyRow {
    preset: &'static str,
    ttl_ms: Option<u64>,
    stale_while_revalidate: bool,
    on_demand_only: bool,
}

impl PolicyRow {
    fn new(preset: PolicyPreset, policy: CachePolicy) -> Self {
        Self {
            preset: preset.as_str(),
            ttl_ms: policy.ttl_ms(),
            stale_while_revalidate: policy.stale_while_revalidate,
            on_demand_only: policy.on_demand_only,
        }
    }
}

fn run_policies(cache: &CacheConfig, args: &PoliciesArgs) -> Result<(), AppError> {
    let rows: Vec<PolicyRow> = cache
        .policy_table()
        .into_iter()
        .filter(|(preset, _)| args.preset.is_none_or(|wanted| wanted == *preset))
        .map(|(preset, policy)| PolicyRow::new(preset, policy))
        .collect();

    let mut out = io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &rows).map_err(InfraError::from)?;
        writeln!(out).map_err(InfraError::from)?;
        return Ok(());
    }

    writeln!(out, "{:<10} {:>10} {:>5} {:>10}", "preset", "ttl", "swr", "on-demand")
        .map_err(InfraError::from)?;
    for row in rows {
        let ttl = match row.ttl_ms {
            Some(ms) => format!("{ms}ms"),
            None => "never".to_string(),
        };
        writeln!(
            out,
            "{:<10} {:>10} {:>5} {:>10}",
            row.preset, ttl, row.stale_while_revalidate, row.on_demand_only
        )
        .map_err(InfraError::from)?;
    }
    Ok(())
}

async fn run_simulate(cache: &CacheConfig, args: &SimulateArgs) -> Result<(), AppError> {
    let plan = SimulationPlan::from(args);
    info!(
        players = plan.players,
        rounds = plan.rounds,
        fail_every = plan.fail_every,
        "starting lobby simulation"
    );

    let client = QueryClient::new();
    let report = simulate::run(&client, cache, plan).await?;

    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &report).map_err(InfraError::from)?;
    writeln!(out).map_err(InfraError::from)?;
    Ok(())
}
