mod config;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;
#[cfg(test)]
mod test_util;
mod workflow_format;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use mender_core::bus::{EventBus, RedisBus};
use mender_core::config::EngineConfig;
use mender_core::detector::FailureDetector;
use mender_core::handler::{HandlerRegistry, SimulatedWork};
use mender_core::orchestrator::Orchestrator;
use mender_core::retry::RetryEngine;
use mender_core::worker::Worker;
use mender_db::pool;

use config::MenderConfig;

#[derive(Parser)]
#[command(name = "mender", about = "Self-healing workflow execution engine")]
struct Cli {
    /// Database URL (overrides MENDER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Redis URL (overrides MENDER_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a mender config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mender")]
        db_url: String,
        /// Redis connection URL
        #[arg(long, default_value = "redis://localhost:6379")]
        bus_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the mender database (create + migrate)
    DbInit,
    /// Run the HTTP submission API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run the workflow orchestrator
    Orchestrator,
    /// Run a task worker
    Worker {
        /// Maximum concurrent task handlers in this process
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
        /// Task types this worker serves (simulated handlers)
        #[arg(long, value_delimiter = ',', default_values_t = [
            "noop".to_string(),
            "http_request".to_string(),
            "compute".to_string(),
        ])]
        task_types: Vec<String>,
    },
    /// Run the retry engine
    RetryEngine {
        /// Base backoff in seconds (wait = base * 2^retry_count)
        #[arg(long, default_value_t = 1)]
        backoff_base: u64,
        /// Maximum backoff in seconds
        #[arg(long, default_value_t = 300)]
        backoff_cap: u64,
    },
    /// Run the stale-task failure detector
    FailureDetector {
        /// Sweep interval in seconds
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Seconds a running task may go unmutated before it is reclaimed
        #[arg(long, default_value_t = 30)]
        stale_timeout: u64,
    },
    /// Submit a workflow from a TOML definition file
    Submit {
        /// Path to the workflow TOML file
        file: String,
    },
    /// Show workflow status (omit workflow_id to list all workflows)
    Status {
        /// Workflow ID to show status for
        workflow_id: Option<String>,
    },
}

/// Execute the `mender init` command: write the config file.
fn cmd_init(db_url: &str, bus_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        bus: config::BusSection {
            url: bus_url.to_string(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  bus.url = {bus_url}");
    println!();
    println!("Next: run `mender db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `mender db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &MenderConfig) -> Result<()> {
    println!("Initializing mender database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::migrate(&db_pool).await?;
    db_pool.close().await;

    println!("mender db-init complete.");
    Ok(())
}

/// Connect to the store and the bus. Failing either is fatal: an engine
/// process without its dependencies cannot do anything useful.
async fn connect(resolved: &MenderConfig) -> Result<(PgPool, Arc<dyn EventBus>)> {
    let db_pool = pool::connect(&resolved.db_config).await?;
    let bus = RedisBus::connect(&resolved.bus_config.redis_url).await?;
    Ok((db_pool, Arc::new(bus)))
}

/// Cancellation token wired to Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = MenderConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;

    match cli.command {
        Commands::Init {
            db_url,
            bus_url,
            force,
        } => {
            cmd_init(&db_url, &bus_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(&resolved).await?;
        }
        Commands::Serve { bind, port } => {
            let (db_pool, bus) = connect(&resolved).await?;
            let result = serve_cmd::run_serve(db_pool.clone(), bus, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Orchestrator => {
            let (db_pool, bus) = connect(&resolved).await?;
            let orchestrator = Orchestrator::new(db_pool.clone(), bus);
            let result = orchestrator.run(shutdown_token()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker {
            concurrency,
            task_types,
        } => {
            let (db_pool, bus) = connect(&resolved).await?;
            let mut registry = HandlerRegistry::new();
            for task_type in &task_types {
                registry.register(SimulatedWork::new(task_type));
            }
            let worker = Worker::new(db_pool.clone(), bus, Arc::new(registry), concurrency);
            let result = worker.run(shutdown_token()).await;
            db_pool.close().await;
            result?;
        }
        Commands::RetryEngine {
            backoff_base,
            backoff_cap,
        } => {
            let (db_pool, bus) = connect(&resolved).await?;
            let engine_config = EngineConfig {
                backoff_base: Duration::from_secs(backoff_base),
                backoff_cap: Duration::from_secs(backoff_cap),
                ..EngineConfig::default()
            };
            let engine = RetryEngine::new(db_pool.clone(), bus, engine_config);
            let result = engine.run(shutdown_token()).await;
            db_pool.close().await;
            result?;
        }
        Commands::FailureDetector {
            interval,
            stale_timeout,
        } => {
            let (db_pool, bus) = connect(&resolved).await?;
            let engine_config = EngineConfig {
                sweep_interval: Duration::from_secs(interval),
                stale_timeout: Duration::from_secs(stale_timeout),
                ..EngineConfig::default()
            };
            let detector = FailureDetector::new(db_pool.clone(), bus, engine_config);
            let result = detector.run(shutdown_token()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Submit { file } => {
            let (db_pool, bus) = connect(&resolved).await?;
            let result = submit_cmd::run_submit(&db_pool, bus, &file).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { workflow_id } => {
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, workflow_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
