use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dispatch_lite::config::{DispatchConfig, NodeConfig};
use dispatch_lite::incident::IncidentReport;
use dispatch_lite::node::Node;
use dispatch_lite::scheduler::Job;
use dispatch_lite::shutdown::cancel_on_signal;
use dispatch_lite::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "Field job dispatcher with time-bounded offers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatch server
    Server(ServerArgs),

    /// Job source commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Worker directory commands
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Incident log commands
    Incident {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: IncidentCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Seconds a worker has to answer an offer
    #[arg(long, default_value = "300")]
    acceptance_window_secs: u64,

    /// Seconds between repeated offer alerts
    #[arg(long, default_value = "10")]
    alert_interval_secs: u64,

    /// Seconds between sweeps over pending jobs
    #[arg(long, default_value = "5")]
    sweep_interval_secs: u64,

    /// Append-only incident log (JSON lines). Incidents stay in memory if unset.
    #[arg(long)]
    incident_log: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

// =============================================================================
// Client Arguments (shared by job, worker and incident commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Report a location that needs service
    Submit {
        /// Job id assigned by the source (e.g. bin number)
        id: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long)]
        address: String,
    },
    /// List jobs
    List {
        /// Only jobs in this status (pending, offered, accepted, completed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Report a location as serviced externally
    Retract { id: String },
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// List registered workers
    List,
}

#[derive(clap::Subcommand, Debug)]
enum IncidentCommands {
    /// Show the incident feed
    List,
}

#[derive(Serialize)]
struct SubmitJobBody<'a> {
    id: &'a str,
    lat: f64,
    lng: f64,
    address: &'a str,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(args.log_json);

    let dispatch = DispatchConfig::default()
        .with_acceptance_window(Duration::from_secs(args.acceptance_window_secs.max(1)))
        .with_alert_interval(Duration::from_secs(args.alert_interval_secs.max(1)))
        .with_sweep_interval(Duration::from_secs(args.sweep_interval_secs.max(1)));
    let mut config = NodeConfig::new(args.listen).with_dispatch(dispatch);
    if let Some(path) = args.incident_log {
        config = config.with_incident_log(path);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        acceptance_window_secs = config.dispatch.acceptance_window.as_secs(),
        alert_interval_secs = config.dispatch.alert_interval.as_secs(),
        incident_log = ?config.incidents.log_path,
        "Starting dispatch-lite"
    );

    let (node, runtime) = Node::new(config);
    cancel_on_signal(node.shutdown_token());
    Arc::new(node).run(runtime).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn url(client: &ClientArgs, path: &str) -> String {
    format!("{}{}", client.addr.trim_end_matches('/'), path)
}

/// Decode a successful body, or print the server's error and exit.
async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    let rejected = body.get("valid").and_then(|v| v.as_bool()) == Some(false);
    if !status.is_success() || rejected {
        let msg = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed");
        eprintln!("Error ({}): {}", status.as_u16(), msg);
        std::process::exit(1);
    }
    Ok(serde_json::from_value(body)?)
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<16} {:<10} {:<7} {:<12} ADDRESS", "JOB ID", "STATUS", "ROUNDS", "WORKER");
    println!("{}", "-".repeat(72));
    for job in jobs {
        let worker = job
            .assigned_worker
            .as_ref()
            .or(job.completed_by.as_ref())
            .map(|w| w.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<10} {:<7} {:<12} {}",
            job.id, job.status, job.offer_rounds, worker, job.address
        );
    }
    println!();
    println!("{} jobs", jobs.len());
}

async fn handle_job_command(
    http: &reqwest::Client,
    client: &ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            id,
            lat,
            lng,
            address,
        } => {
            let response = http
                .post(url(client, "/api/jobs"))
                .json(&SubmitJobBody {
                    id: &id,
                    lat,
                    lng,
                    address: &address,
                })
                .send()
                .await?;
            let job: Job = decode(response).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job.id);
                }
            }
        }
        JobCommands::List { status } => {
            let mut request = http.get(url(client, "/api/jobs"));
            if let Some(status) = status {
                request = request.query(&[("status", status)]);
            }
            let jobs: Vec<Job> = decode(request.send().await?).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => print_jobs(&jobs),
            }
        }
        JobCommands::Retract { id } => {
            let response = http
                .delete(url(client, &format!("/api/jobs/{}", id)))
                .send()
                .await?;
            let job: Job = decode(response).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => println!("Job {} is {}", job.id, job.status),
            }
        }
    }
    Ok(())
}

async fn handle_worker_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let workers: Vec<Worker> = decode(http.get(url(client, "/api/workers")).send().await?).await?;
    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!("{:<12} {:<24} {:<9} {:<16} LOCATION", "ID", "NAME", "STATUS", "JOB");
            println!("{}", "-".repeat(80));
            for worker in &workers {
                let job = worker
                    .active_job_id
                    .as_ref()
                    .map(|j| j.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let location = worker
                    .location
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} {:<24} {:<9} {:<16} {}",
                    worker.id,
                    worker.label(),
                    worker.status,
                    job,
                    location
                );
            }
        }
    }
    Ok(())
}

async fn handle_incident_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let incidents: Vec<IncidentReport> =
        decode(http.get(url(client, "/api/incidents")).send().await?).await?;
    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&incidents)?),
        OutputFormat::Table => {
            if incidents.is_empty() {
                println!("No incidents recorded.");
                return Ok(());
            }
            for report in &incidents {
                println!(
                    "{}  {:<10} job={} worker={}  {}",
                    report.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    report.kind,
                    report.job_id,
                    report.worker_id,
                    report.message
                );
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
    let args = Args::parse();
    let http = reqwest::Client::new();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            handle_job_command(&http, &client, command).await?;
        }
        Commands::Worker { client, command } => match command {
            WorkerCommands::List => handle_worker_list(&http, &client).await?,
        },
        Commands::Incident { client, command } => match command {
            IncidentCommands::List => handle_incident_list(&http, &client).await?,
        },
    }

    Ok(())
}
