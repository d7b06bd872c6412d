mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::api::ServeSettings;
use crate::engine::types::{Job, JobStatus};
use crate::flows::FlowRegistry;
use crate::gateway::RpcSettings;
use crate::storage::{self, JobStore};

pub use config::{DEFAULT_CONFIG_FILE, GatewayConfig};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/flowgate.db?mode=rwc";
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:10050";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BODY: usize = 1_048_576;

#[derive(Parser)]
#[command(name = "flowgate", version, about = "REST gateway for a remote flow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a config file (default: auto-detect flowgate.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve(ServeArgs),

    /// List tracked jobs
    Jobs {
        /// Filter by status (running, completed, failed)
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Job store URL (sqlite://..., postgres://..., or memory)
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show the stored outcome of one job
    Inspect {
        /// Client id (idempotency key) of the job
        client_id: String,

        /// Job store URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },

    /// List flow types deployed through manifest locations
    Flows {
        /// Extra manifest file or directory (repeatable)
        #[arg(long = "flow-location")]
        flow_locations: Vec<PathBuf>,
    },

    /// Delete every tracked job
    Purge {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,

        /// Job store URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Job store URL (sqlite://..., postgres://..., or memory)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Base URL of the flow engine's RPC endpoint
    #[arg(long, env = "ENGINE_URL")]
    pub engine_url: Option<String>,

    #[arg(long, env = "ENGINE_USERNAME")]
    pub engine_username: Option<String>,

    #[arg(long, env = "ENGINE_PASSWORD", hide_env_values = true)]
    pub engine_password: Option<String>,

    /// Delay between outcome polls, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Timeout for a single engine request, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Flow manifest files or directories (comma separated in env)
    #[arg(long = "flow-location", env = "FLOW_LOCATIONS", value_delimiter = ',')]
    pub flow_locations: Vec<PathBuf>,

    /// Maximum request body size in bytes (default: 1048576 = 1 MB)
    #[arg(long, env = "MAX_BODY")]
    pub max_body: Option<usize>,
}

impl ServeArgs {
    /// Merge with the config file: CLI/env first, then YAML, then defaults.
    pub fn resolve(self, cfg: GatewayConfig) -> ServeSettings {
        let database_url = database_url(self.database_url, &cfg);

        let mut rpc = RpcSettings::new(
            self.engine_url
                .or(cfg.engine_url)
                .unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string()),
        );
        rpc.username = self.engine_username.or(cfg.engine_username);
        rpc.password = self.engine_password.or(cfg.engine_password);
        rpc.poll_interval = Duration::from_millis(
            self.poll_interval_ms
                .or(cfg.poll_interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        rpc.request_timeout = Duration::from_millis(
            self.request_timeout_ms
                .or(cfg.request_timeout_ms)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        );

        let flow_locations = if self.flow_locations.is_empty() {
            cfg.flow_locations
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect()
        } else {
            self.flow_locations
        };

        ServeSettings {
            host: self
                .host
                .or(cfg.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.or(cfg.port).unwrap_or(DEFAULT_PORT),
            database_url,
            rpc,
            flow_locations,
            max_body: self.max_body.or(cfg.max_body).unwrap_or(DEFAULT_MAX_BODY),
        }
    }
}

fn database_url(explicit: Option<String>, cfg: &GatewayConfig) -> String {
    explicit
        .or_else(|| cfg.database_url.clone())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let cfg = GatewayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => crate::api::serve(args.resolve(cfg)).await,
        Commands::Jobs {
            status,
            database_url: url,
            format,
        } => cmd_jobs(status, database_url(url, &cfg), format).await,
        Commands::Inspect {
            client_id,
            database_url: url,
        } => cmd_inspect(client_id, database_url(url, &cfg)).await,
        Commands::Flows { flow_locations } => cmd_flows(flow_locations, &cfg).await,
        Commands::Purge {
            yes,
            database_url: url,
        } => cmd_purge(yes, database_url(url, &cfg)).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_store(database_url: &str) -> Result<std::sync::Arc<dyn JobStore>> {
    storage::connect(database_url)
        .await
        .with_context(|| format!("Failed to open job store '{}'", database_url))
}

fn job_json(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "clientId": job.idempotency_key,
        "flowId": job.execution_id,
        "status": job.status(),
        "resultJson": job.result_json(),
        "exceptionDigest": job.failure(),
        "created": job.created,
        "updated": job.updated,
    })
}

async fn cmd_jobs(status: Option<JobStatus>, database_url: String, format: String) -> Result<()> {
    let store = open_store(&database_url).await?;

    let statuses = match status {
        Some(s) => vec![s],
        None => vec![JobStatus::Running, JobStatus::Completed, JobStatus::Failed],
    };
    let mut jobs = Vec::new();
    for s in statuses {
        jobs.extend(store.find_all_by_status(s).await?);
    }
    jobs.sort_by(|a, b| a.created.cmp(&b.created));

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    if format == "json" {
        let rows: Vec<serde_json::Value> = jobs.iter().map(job_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    // Table format
    println!(
        "{:<32} {:<38} {:<10} {:<20}",
        "CLIENT ID", "FLOW ID", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(102));

    for job in &jobs {
        let flow_id = job
            .execution_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<32} {:<38} {:<10} {:<20}",
            job.idempotency_key,
            flow_id,
            job.status(),
            job.created.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} job(s)", jobs.len());
    Ok(())
}

async fn cmd_inspect(client_id: String, database_url: String) -> Result<()> {
    let store = open_store(&database_url).await?;

    let job = store
        .find_by_key(&client_id)
        .await?
        .with_context(|| format!("Job '{}' not found", client_id))?;

    println!("{}", serde_json::to_string_pretty(&job_json(&job))?);
    Ok(())
}

async fn cmd_flows(extra: Vec<PathBuf>, cfg: &GatewayConfig) -> Result<()> {
    let mut locations: Vec<PathBuf> = cfg
        .flow_locations
        .iter()
        .flatten()
        .map(PathBuf::from)
        .collect();
    locations.extend(extra);

    let registry = FlowRegistry::with_locations(&locations).await?;
    let flows = registry.list().await;

    println!("{:<40} PARAMETERS", "FLOW TYPE");
    println!("{}", "-".repeat(72));

    for flow in &flows {
        let params: Vec<&str> = flow.parameters.iter().map(|p| p.name.as_str()).collect();
        println!("{:<40} {}", flow.name, params.join(", "));
    }

    println!("\nTotal: {} flow(s)", flows.len());
    Ok(())
}

async fn cmd_purge(yes: bool, database_url: String) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete every job without --yes");
    }
    let store = open_store(&database_url).await?;
    let removed = store.remove_all().await?;
    println!("Removed {} job(s)", removed);
    Ok(())
}
