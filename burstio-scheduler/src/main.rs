//! burstio scheduler service
//!
//! Runs one task scheduler per central queue shard until interrupted.

use anyhow::{Context, Result};
use burstio_core::{BurstConfig, SolverKind, StoreBackend};
use burstio_scheduler::TaskScheduler;
use burstio_storage::StoreHandle;
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burstio-scheduler")]
#[command(about = "burstio task scheduler")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "burstio.toml", env = "BURSTIO_CONFIG")]
    config: PathBuf,

    /// Serve a single shard instead of all of them
    #[arg(long)]
    shard: Option<usize>,

    /// Placement solver (knapsack, round_robin, random, default)
    #[arg(long)]
    solver: Option<SolverKind>,

    /// Store URL (overrides config file)
    #[arg(long)]
    store_url: Option<String>,

    /// Verbose output
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
    if let Some(url) = cli.store_url {
        config.store.url = url;
        config.store.backend = StoreBackend::Redis;
    }
    if let Some(solver) = cli.solver {
        config.scheduler.solver = solver;
    }
    config.validate()?;

    if !config.store.backend.is_shared() {
        anyhow::bail!(
            "the {:?} store is private to one process; daemons need [store] backend = \"redis\"",
            config.store.backend
        );
    }

    let shards: Vec<usize> = match cli.shard {
        Some(shard) if shard >= config.scheduler.shards => {
            anyhow::bail!(
                "shard {} out of range, {} configured",
                shard,
                config.scheduler.shards
            );
        }
        Some(shard) => vec![shard],
        None => (0..config.scheduler.shards).collect(),
    };

    let store = StoreHandle::connect(&config.store)
        .await
        .context("Failed to connect to store")?;

    info!(
        shards = ?shards,
        solver = ?config.scheduler.solver,
        workers = config.worker.count,
        "Starting burstio scheduler"
    );

    let shutdown = CancellationToken::new();
    let handles: Vec<_> = shards
        .into_iter()
        .map(|shard| {
            let scheduler = TaskScheduler::new(shard, store.clone(), &config);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for result in join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Scheduler exited with error"),
            Err(e) => error!(error = %e, "Scheduler task panicked"),
        }
    }
    Ok(())
}
