//! sync-bridge: SQL Server to PostgreSQL job bridge.

use std::sync::Arc;
use sync_bridge::bridge::{open_store, shutdown_signal, Bridge};
use sync_bridge::cli::{Cli, Command, OutputFormat};
use sync_bridge::config::Config;
use sync_bridge::error::{BridgeError, Result};
use sync_bridge::jobs::{Dispatcher, JobFilter, JobStore, SyncJob};
use sync_bridge::knowledge::ingest_dir;
use sync_bridge::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    match cli.log_path() {
        Some(path) => {
            if let Err(e) = logging::init_file_logging(&path) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    match cli.command() {
        Command::Run { .. } => {
            let bridge = Bridge::from_config(config).await?;
            bridge.run(shutdown_signal()).await
        }
        Command::Dispatch { query_name } => {
            let store = Arc::new(open_store(&config).await?);
            let id = Dispatcher::new(store.clone()).dispatch(&query_name).await?;
            println!("{id}");
            store.close().await;
            Ok(())
        }
        Command::Status { job_id } => {
            let store = open_store(&config).await?;
            let job = store.get(job_id).await?;
            store.close().await;

            let job = job.ok_or_else(|| BridgeError::lookup(format!("Job {job_id} not found")))?;
            print_job(&job);
            if let Some(message) = &job.error_message {
                println!("  {message}");
            }
            Ok(())
        }
        Command::Jobs {
            status,
            query,
            limit,
            output,
        } => {
            let store = open_store(&config).await?;
            let jobs = store
                .list(&JobFilter {
                    status,
                    query_name: query,
                    limit: Some(limit),
                })
                .await?;
            store.close().await;

            match output {
                OutputFormat::Text => jobs.iter().for_each(print_job),
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&jobs).map_err(|e| {
                        BridgeError::internal(format!("Failed to encode jobs: {e}"))
                    })?;
                    println!("{json}");
                }
            }
            Ok(())
        }
        Command::Migrate => {
            let store = open_store(&config).await?;
            let version = sync_bridge::store::current_version(store.pool()).await?;
            store.close().await;
            println!("Primary database at schema version {version}");
            Ok(())
        }
        Command::Ingest { dir } => {
            let store = open_store(&config).await?;
            let report = ingest_dir(&store, &dir).await?;
            store.close().await;

            info!(
                "Ingested {} queries, {} failed",
                report.ingested.len(),
                report.failed.len()
            );
            println!(
                "Ingested {} queries, {} failed",
                report.ingested.len(),
                report.failed.len()
            );
            for (path, reason) in &report.failed {
                println!("  {}: {}", path.display(), reason);
            }
            Ok(())
        }
    }
}

/// Resolves configuration with precedence: CLI, then config file, then environment.
fn resolve_config(cli: &Cli) -> Result<Config> {
    Config::load_dotenv();

    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;

    cli.apply_overrides(&mut config)?;
    config.apply_env_defaults();

    Ok(config)
}

fn print_job(job: &SyncJob) {
    println!(
        "{}  {:<8} {:<30} {}",
        job.id,
        job.status.as_str(),
        job.query_name,
        job.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}
