use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pulse_core::{resolve_run, PhaseName, RunTarget};
use pulse_pipeline::{
    build_weekly_scheduler, PhaseOutcome, PipelineConfig, PipelineError, PulseService, RunPlan,
};
use pulse_storage::{PhaseStateStore, RunRegistry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "pulse")]
#[command(about = "Weekly app-review pulse pipeline")]
struct Cli {
    /// Pipeline config file; defaults to $PULSE_CONFIG or ./pulse.yaml.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every phase in order, skipping the ones already done.
    Run {
        /// ISO week (YYYY-Www) or custom run label; defaults to last week.
        #[arg(long)]
        week: Option<String>,
        /// Ingest the last N weeks instead of a single week.
        #[arg(long)]
        lookback: Option<u32>,
        /// Re-execute this phase even if it is already done or failed.
        #[arg(long)]
        force: Option<PhaseName>,
        /// Render and record the email without delivering it. The email phase
        /// still counts as done; deliver later with `--force email`.
        #[arg(long)]
        draft_only: bool,
        /// Print the plan and current phase status, then exit.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single phase; its upstream phases must already be done.
    Phase {
        phase: PhaseName,
        #[arg(long)]
        week: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Show per-phase status for a run.
    Status {
        #[arg(long)]
        week: Option<String>,
    },
    /// List archived runs, newest first.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the full pipeline on the configured weekly cron until interrupted.
    Schedule,
}

enum Failure {
    Usage(anyhow::Error),
    Pipeline(anyhow::Error),
}

impl From<PipelineError> for Failure {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidPlan(_) => Failure::Usage(err.into()),
            other => Failure::Pipeline(other.into()),
        }
    }
}

fn usage(err: impl Into<anyhow::Error>) -> Failure {
    Failure::Usage(err.into())
}

fn pipeline(err: impl Into<anyhow::Error>) -> Failure {
    Failure::Pipeline(err.into())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialise logging: {err:#}");
    }
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(Failure::Usage(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_USAGE)
        }
        Err(Failure::Pipeline(err)) => {
            error!(error = %format!("{err:#}"), "pulse failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pulse=info".parse()?))
        .init();
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load_with_overrides(path, |key| std::env::var(key).ok()),
        None => PipelineConfig::from_env(),
    }
}

fn resolve(week: Option<&str>, lookback: Option<u32>) -> Result<RunTarget, Failure> {
    resolve_run(week, lookback, Utc::now().date_naive()).map_err(usage)
}

async fn execute(cli: Cli) -> Result<ExitCode, Failure> {
    let mut config = load_config(cli.config.as_deref()).map_err(usage)?;

    match cli.command.unwrap_or(Commands::Run {
        week: None,
        lookback: None,
        force: None,
        draft_only: false,
        dry_run: false,
    }) {
        Commands::Run {
            week,
            lookback,
            force,
            draft_only,
            dry_run,
        } => {
            let target = resolve(week.as_deref(), lookback)?;
            if dry_run {
                print_status(&config, &target, force).await?;
                return Ok(ExitCode::SUCCESS);
            }
            if draft_only {
                config.email.draft_only = true;
            }
            let service = PulseService::from_config(&config).map_err(usage)?;
            let report = service.run(&target, &RunPlan::full(), force).await?;
            for (phase, outcome) in &report.outcomes {
                println!("{:<9} {outcome}", phase.as_str());
            }
            println!("{}", report.summary());
            Ok(if report.failure().is_some() {
                ExitCode::from(EXIT_FAILURE)
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Phase { phase, week, force } => {
            let target = resolve(week.as_deref(), None)?;
            let service = PulseService::from_config(&config).map_err(usage)?;
            let outcome = service.run_phase(&target, phase, force).await?;
            println!("{}: {phase} {outcome}", target.run_label);
            Ok(match outcome {
                PhaseOutcome::Failed { .. } => ExitCode::from(EXIT_FAILURE),
                _ => ExitCode::SUCCESS,
            })
        }
        Commands::Status { week } => {
            let target = resolve(week.as_deref(), None)?;
            print_status(&config, &target, None).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { limit } => {
            let registry = RunRegistry::new(&config.data_root);
            let mut entries = registry.entries().await.map_err(pipeline)?;
            entries.reverse();
            entries.truncate(limit);
            if entries.is_empty() {
                println!("no archived runs in {}", registry.path().display());
            }
            for entry in entries {
                println!(
                    "{:<14} {:>3}/100 {:<9} reviews={:<5} sent={} themes={} ({})",
                    entry.run_label,
                    entry.health_score,
                    entry.health_label,
                    entry.clean_review_count,
                    entry.email_sent,
                    entry.top_theme_ids.join(","),
                    entry.completed_at.to_rfc3339()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let cron = config.schedule.cron.clone();
            let service = Arc::new(PulseService::from_config(&config).map_err(usage)?);
            let mut sched = build_weekly_scheduler(service, &cron)
                .await
                .map_err(usage)?;
            sched
                .start()
                .await
                .context("starting scheduler")
                .map_err(pipeline)?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")
                .map_err(pipeline)?;
            sched
                .shutdown()
                .await
                .context("stopping scheduler")
                .map_err(pipeline)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Read-only view of a run; needs no collaborator credentials.
async fn print_status(
    config: &PipelineConfig,
    target: &RunTarget,
    force: Option<PhaseName>,
) -> Result<(), Failure> {
    let state = PhaseStateStore::new(config.data_root.clone())
        .load(&target.run_label)
        .await
        .map_err(pipeline)?;
    let window = state.window.unwrap_or(target.window);
    println!(
        "{}  {} .. {}",
        target.run_label, window.date_from, window.date_to
    );
    for phase in PhaseName::ALL {
        let record = state.record(phase);
        let marker = if force == Some(phase) { " (forced)" } else { "" };
        let detail = record
            .error
            .or(record.output_path)
            .unwrap_or_default();
        println!("  {:<9} {:<8}{marker} {detail}", phase.as_str(), record.status.as_str());
    }
    Ok(())
}
