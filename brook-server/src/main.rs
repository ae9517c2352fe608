//! brook-server: runs one partition over a file-backed log.
//!
//! # Usage
//!
//! ```bash
//! # Serve JSON-lines requests on stdin, responses on stdout
//! brook-server run --config brook.yaml
//!
//! # Rebuild state from a log and print its digest
//! brook-server replay --log brook.log.jsonl
//!
//! # Active incidents of one process instance
//! brook-server incidents --log brook.log.jsonl --instance 2251799813685251
//! ```

mod config;
mod requests;

use anyhow::{Context, Result};
use brook_core::{
    Clock, EngineState, FileLog, Key, OrderedLog, Partition, PartitionId, ProcessModel,
    StreamProcessor, SystemClock,
};
use clap::{Parser, Subcommand};
use config::ServerConfig;
use requests::{execute, parse_line, ClientResponse};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "brook-server")]
#[command(version)]
#[command(about = "Deterministic BPMN workflow engine over an ordered log")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a partition, reading requests from stdin
    Run {
        /// YAML config file
        #[arg(short, long, env = "BROOK_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Replay a log and print the resulting state digest
    Replay {
        /// Partition log file
        #[arg(short, long)]
        log: PathBuf,

        /// Partition id the log was written with
        #[arg(short, long, default_value_t = 1)]
        partition: PartitionId,
    },

    /// List the active incidents of a process instance
    Incidents {
        /// Partition log file
        #[arg(short, long)]
        log: PathBuf,

        /// Process instance key
        #[arg(short, long)]
        instance: Key,

        /// Partition id the log was written with
        #[arg(short, long, default_value_t = 1)]
        partition: PartitionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries responses; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,brook_core=debug,brook_server=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config.as_deref()).await,
        Commands::Replay { log, partition } => {
            let state = replay(&log, partition).await?;
            let summary = json!({
                "digest": state.digest()?,
                "last_processed_position": state.last_processed_position(),
                "definitions": state.definitions.len(),
                "element_instances": state.elements.len(),
                "jobs": state.jobs.len(),
                "incidents": state.incidents.len(),
                "timers": state.timers.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Incidents {
            log,
            instance,
            partition,
        } => {
            let state = replay(&log, partition).await?;
            let incidents = state.incidents.list_for_process(instance);
            println!("{}", serde_json::to_string_pretty(&incidents)?);
            Ok(())
        }
    }
}

/// Rebuilds partition state from a log file without starting any tasks.
async fn replay(path: &Path, partition_id: PartitionId) -> Result<EngineState> {
    let log = FileLog::open(path, partition_id, Arc::new(SystemClock))
        .await
        .with_context(|| format!("Failed to open log {}", path.display()))?;
    let mut processor = StreamProcessor::new(partition_id, Default::default());
    let report = processor
        .recover(&log)
        .await
        .context("Failed to replay log")?;
    tracing::info!(
        replayed = report.replayed,
        last_position = report.last_position,
        "Replay finished"
    );
    Ok(processor.into_state())
}

async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let log: Arc<dyn OrderedLog> = Arc::new(
        FileLog::open(&config.log_path, config.engine.partition_id, clock.clone())
            .await
            .with_context(|| format!("Failed to open log {}", config.log_path.display()))?,
    );

    let partition = Partition::start(config.engine.clone(), log, clock)
        .await
        .context("Failed to start partition")?;
    let client = partition.client();

    for path in config.model_files()? {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read model {}", path.display()))?;
        let model = ProcessModel::from_yaml(&content)
            .with_context(|| format!("Failed to parse model {}", path.display()))?;
        let deployed = client
            .deploy(model)
            .await
            .with_context(|| format!("Failed to deploy model {}", path.display()))?;
        tracing::info!(
            bpmn_process_id = %deployed.model.id,
            version = deployed.version,
            duplicate = deployed.duplicate,
            "Deployed process model"
        );
    }

    let (out_tx, mut out_rx) = mpsc::channel::<ClientResponse>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = out_rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    tracing::info!(
        partition_id = partition.partition_id(),
        log = %config.log_path.display(),
        "brook-server ready, reading requests from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match parse_line(&line) {
                    Ok(request) => {
                        let client = client.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let response = execute(&client, request).await;
                            let _ = out_tx.send(response).await;
                        });
                    }
                    Err(response) => {
                        let _ = out_tx.send(response).await;
                    }
                },
                None => {
                    tracing::info!("stdin closed, waiting for in-flight requests");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    drop(out_tx);
    writer.await.context("Response writer panicked")??;
    partition.shutdown().await;
    Ok(())
}
