//! tesserad — the Tessera admission daemon.
//!
//! Single binary that loads a cluster definition and node inventory from a
//! TOML file and drives the admission scheduler:
//! - `run` cycles until interrupted, logging execution commands
//! - `admit` runs a fixed number of cycles and prints the outcome as JSON
//! - `check` validates a configuration file
//!
//! # Usage
//!
//! ```text
//! tesserad run --config demos/gpu-cluster/tessera.toml
//! tesserad --log-format json admit --config tessera.toml --cycles 2
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_quota::QuotaLedger;
use tessera_scheduler::{AdmissionScheduler, ChannelAdapter, CycleReport, ExecutionCommand};
use tessera_state::Workload;
use tessera_topology::SnapshotStore;

use crate::config::{TesseraConfig, parse_duration};

const DEFAULT_LOG_FILTER: &str = "info,tesserad=debug,tessera=debug";

#[derive(Parser)]
#[command(name = "tesserad", about = "Tessera topology-aware admission daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run admission cycles until Ctrl-C.
    Run {
        /// Configuration file.
        #[arg(long, short, default_value = "tessera.toml")]
        config: PathBuf,

        /// Override the configured cycle interval, e.g. "500ms".
        #[arg(long)]
        interval: Option<String>,
    },
    /// Submit the configured jobs, run a number of cycles and print the result.
    Admit {
        /// Configuration file.
        #[arg(long, short, default_value = "tessera.toml")]
        config: PathBuf,

        /// Admission cycles to run.
        #[arg(long, default_value = "1")]
        cycles: u32,
    },
    /// Validate a configuration file and exit.
    Check {
        /// Configuration file.
        #[arg(long, short, default_value = "tessera.toml")]
        config: PathBuf,
    },
}

/// Printed by `admit`.
#[derive(Serialize)]
struct AdmitOutput {
    cycles: Vec<CycleReport>,
    workloads: Vec<Workload>,
    commands: Vec<ExecutionCommand>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, interval } => run(&config, interval.as_deref()).await,
        Command::Admit { config, cycles } => admit(&config, cycles).await,
        Command::Check { config } => check(&config),
    }
}

/// Logs go to stderr so `admit` output on stdout stays machine-readable.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load(path: &Path) -> anyhow::Result<TesseraConfig> {
    let config = TesseraConfig::from_file(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Build a scheduler over `config`, feed it the node inventory and submit
/// the configured jobs.
async fn start_scheduler(
    config: &TesseraConfig,
    interval: Option<&str>,
) -> anyhow::Result<(Arc<AdmissionScheduler>, mpsc::UnboundedReceiver<ExecutionCommand>)> {
    let mut sched_config = config.scheduler_config()?;
    if let Some(interval) = interval {
        sched_config.cycle_interval = parse_duration(interval).context("--interval")?;
    }

    let (adapter, commands) = ChannelAdapter::new();
    let scheduler = AdmissionScheduler::new(
        config.definition(),
        Arc::new(QuotaLedger::new()),
        Arc::new(SnapshotStore::new()),
        Arc::new(adapter),
        sched_config,
    )
    .await
    .context("initializing scheduler")?;

    scheduler.update_nodes(config.nodes.clone()).await;
    info!(nodes = config.nodes.len(), "node inventory loaded");

    for job in &config.jobs {
        let key = scheduler
            .submit_job(job)
            .await
            .with_context(|| format!("submitting job {}/{}", job.namespace, job.name))?;
        info!(workload = %key, "job submitted");
    }

    Ok((Arc::new(scheduler), commands))
}

async fn run(path: &Path, interval: Option<&str>) -> anyhow::Result<()> {
    info!(path = %path.display(), "Tessera daemon starting");

    let config = load(path)?;
    let (scheduler, mut commands) = start_scheduler(&config, interval).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_scheduler = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        loop_scheduler.run(shutdown_rx).await;
    });

    // No execution controller is attached, so directives are logged.
    let command_handle = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match serde_json::to_string(&command) {
                Ok(json) => info!(command = %json, "execution command"),
                Err(e) => warn!(error = %e, "failed to encode execution command"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    // Dropping the last handle closes the command channel.
    drop(scheduler);
    let _ = command_handle.await;

    info!("Tessera daemon stopped");
    Ok(())
}

async fn admit(path: &Path, cycles: u32) -> anyhow::Result<()> {
    let config = load(path)?;
    let (scheduler, mut commands) = start_scheduler(&config, None).await?;

    let mut reports = Vec::with_capacity(cycles as usize);
    for _ in 0..cycles {
        reports.push(scheduler.run_cycle().await?);
    }

    let mut issued = Vec::new();
    while let Ok(command) = commands.try_recv() {
        issued.push(command);
    }

    let mut workloads = scheduler.workloads().await;
    workloads.sort_by_key(|w| w.key());

    let output = AdmitOutput {
        cycles: reports,
        workloads,
        commands: issued,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    info!(
        topologies = config.topologies.len(),
        flavors = config.flavors.len(),
        cluster_queues = config.cluster_queues.len(),
        local_queues = config.local_queues.len(),
        nodes = config.nodes.len(),
        jobs = config.jobs.len(),
        "configuration is valid"
    );
    println!("{}: ok", path.display());
    Ok(())
}
