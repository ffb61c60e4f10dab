//! burstio worker daemon
//!
//! Runs one or more workers until interrupted. Each worker prepares its
//! staging directory, then serves its queue.

use anyhow::{Context, Result};
use burstio_core::{BurstConfig, StoreBackend, WorkerId};
use burstio_storage::StoreHandle;
use burstio_worker::Worker;
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burstio-worker")]
#[command(about = "burstio worker daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "burstio.toml", env = "BURSTIO_CONFIG")]
    config: PathBuf,

    /// Run a single worker index instead of all configured workers
    #[arg(short, long)]
    index: Option<WorkerId>,

    /// Staging directory (overrides config file)
    #[arg(short, long)]
    staging_dir: Option<PathBuf>,

    /// Store URL (overrides config file)
    #[arg(long)]
    store_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();

    let mut config = BurstConfig::load_or_default(&cli.config).with_env_overrides();
    if let Some(dir) = cli.staging_dir {
        config.worker.staging_dir = dir;
    }
    if let Some(url) = cli.store_url {
        config.store.url = url;
        config.store.backend = StoreBackend::Redis;
    }
    config.validate()?;

    if !config.store.backend.is_shared() {
        anyhow::bail!(
            "the {:?} store is private to one process; daemons need [store] backend = \"redis\"",
            config.store.backend
        );
    }

    let indices: Vec<WorkerId> = match cli.index {
        Some(index) if index as usize >= config.worker.count => {
            anyhow::bail!(
                "worker index {} out of range, {} configured",
                index,
                config.worker.count
            );
        }
        Some(index) => vec![index],
        None => (0..config.worker.count as WorkerId).collect(),
    };

    let store = StoreHandle::connect(&config.store)
        .await
        .context("Failed to connect to store")?;

    info!(
        workers = ?indices,
        staging_dir = %config.worker.staging_dir.display(),
        "Starting burstio worker"
    );

    let shutdown = CancellationToken::new();
    let mut handles = Vec::with_capacity(indices.len());
    for id in indices {
        let worker = Worker::start(id, store.clone(), &config)
            .await
            .with_context(|| format!("Failed to start worker {}", id))?;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for result in join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
            Err(e) => error!(error = %e, "Worker task panicked"),
        }
    }
    Ok(())
}
