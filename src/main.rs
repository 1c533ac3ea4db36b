use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cryoqueue::api::{run_api, ApiState};
use cryoqueue::config::{load_fleet, SchedulerConfig, ServerConfig};
use cryoqueue::error::SchedulerError;
use cryoqueue::scheduler::event::log_events;
use cryoqueue::scheduler::{RejectReason, RequirementSpec, Scheduler};
use cryoqueue::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cryoqueue")]
#[command(version)]
#[command(about = "Queue scheduler for shared cryogenic measurement machines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the scheduling API
    Server(ServerArgs),

    /// Show which machine a requirement would be placed on, without queueing it
    Match(MatchArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Path to the fleet file (JSON, `{"machines": [...]}`)
    #[arg(long, default_value = "fleet.json")]
    fleet: PathBuf,

    /// Milliseconds to wait for a busy machine queue before reporting a conflict
    #[arg(long, default_value = "2000")]
    lock_timeout_ms: u64,

    /// Attempts for mutations that hit a conflict
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Also place new requests on unavailable machines
    #[arg(long)]
    include_unavailable: bool,
}

#[derive(Parser, Debug)]
struct MatchArgs {
    /// Path to the fleet file
    #[arg(long, default_value = "fleet.json")]
    fleet: PathBuf,

    /// Path to a requirement spec (JSON)
    #[arg(long)]
    request: PathBuf,

    /// Also consider unavailable machines
    #[arg(long)]
    include_unavailable: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct MatchOutput {
    matched: bool,
    machine_id: Option<u64>,
    machine_name: Option<String>,
    estimated_start: Option<String>,
    compatible: Vec<u64>,
    rejections: Vec<RejectionOutput>,
}

#[derive(Serialize)]
struct RejectionOutput {
    machine_id: u64,
    machine_name: String,
    criterion: String,
    detail: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let scheduler_config = SchedulerConfig::default()
        .with_lock_timeout(Duration::from_millis(args.lock_timeout_ms))
        .with_conflict_retries(args.retries)
        .with_skip_unavailable(!args.include_unavailable);
    let config = ServerConfig::new(listen_addr, args.fleet).with_scheduler(scheduler_config);

    let machines = load_fleet(&config.fleet_path)?;
    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), machines)?);

    tracing::info!(
        listen_addr = %config.listen_addr,
        fleet = %config.fleet_path.display(),
        machines = scheduler.machine_ids().len(),
        lock_timeout_ms = args.lock_timeout_ms,
        "Starting cryoqueue"
    );

    let shutdown = install_shutdown_handler()?;
    let logger = tokio::spawn(log_events(scheduler.subscribe(), shutdown.clone()));

    run_api(config.listen_addr, ApiState::new(scheduler), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = logger.await {
        tracing::warn!(error = %e, "Event logger task failed");
    }
    Ok(())
}

// =============================================================================
// Match Command
// =============================================================================

fn run_match(args: MatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let machines = load_fleet(&args.fleet)?;
    let text = std::fs::read_to_string(&args.request)?;
    let requirement: RequirementSpec = serde_json::from_str(&text)?;

    let config = SchedulerConfig::default().with_skip_unavailable(!args.include_unavailable);
    let scheduler = Scheduler::new(config, machines)?;
    let compatible = scheduler.compatible_machines(&requirement)?;
    let names: std::collections::HashMap<u64, String> = scheduler
        .snapshots()
        .iter()
        .map(|s| (s.machine.id, s.machine.name.clone()))
        .collect();

    let output = match scheduler.preview(&requirement) {
        Ok(selection) => MatchOutput {
            matched: true,
            machine_id: Some(selection.machine_id),
            machine_name: names.get(&selection.machine_id).cloned(),
            estimated_start: Some(selection.estimated_start.to_rfc3339()),
            compatible,
            rejections: Vec::new(),
        },
        Err(SchedulerError::NoMatch(no_match)) => MatchOutput {
            matched: false,
            machine_id: None,
            machine_name: None,
            estimated_start: None,
            compatible,
            rejections: no_match
                .rejections
                .into_iter()
                .map(|r| {
                    let criterion = match &r.reason {
                        RejectReason::Unavailable => "unavailable".to_string(),
                        RejectReason::Incompatible { detail } => detail.criterion().to_string(),
                    };
                    RejectionOutput {
                        machine_id: r.machine_id,
                        machine_name: r.machine_name,
                        criterion,
                        detail: r.reason.to_string(),
                    }
                })
                .collect(),
        },
        Err(e) => return Err(e.into()),
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if let (Some(id), Some(start)) = (output.machine_id, &output.estimated_start) {
                let name = output.machine_name.as_deref().unwrap_or("-");
                println!("Matched machine {} ({})", id, name);
                println!("Estimated start: {}", start);
                println!(
                    "Compatible machines: {}",
                    output
                        .compatible
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            } else {
                println!("No machine can take this request.");
                println!();
                println!("{:<6} {:<20} {:<16} DETAIL", "ID", "MACHINE", "CRITERION");
                println!("{}", "-".repeat(78));
                for r in &output.rejections {
                    println!(
                        "{:<6} {:<20} {:<16} {}",
                        r.machine_id, r.machine_name, r.criterion, r.detail
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Match(match_args) => {
            run_match(match_args)?;
        }
    }

    Ok(())
}
