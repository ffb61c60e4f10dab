//! burstio CLI
//!
//! Moves files in and out of a running burstio deployment.
//!
//! # Commands
//! - `put` - Copy a local file into a virtualized path
//! - `get` - Copy a virtualized path to a local file
//! - `stat` - Show the open state of a file
//! - `flush` - Write a file back to the parallel file system
//! - `rm` - Unlink a file
//! - `stage` - Prefetch a parallel file system range into worker staging

use anyhow::{Context, Result};
use burstio_client::BurstClient;
use burstio_core::{BurstConfig, OpenMode, StoreBackend};
use burstio_storage::StoreHandle;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burstio")]
#[command(about = "burstio burst-buffer client")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "burstio.toml", env = "BURSTIO_CONFIG")]
    config: PathBuf,

    /// Store URL (overrides config file)
    #[arg(long, global = true)]
    store_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a local file into burstio
    Put {
        /// Local source file
        local: PathBuf,

        /// Virtualized target path
        path: String,

        /// Bytes per write call
        #[arg(long, default_value = "4194304")]
        block_size: usize,

        /// Flush to the parallel file system afterwards
        #[arg(long)]
        flush: bool,
    },

    /// Copy a file out of burstio
    Get {
        /// Virtualized source path
        path: String,

        /// Local target file
        local: PathBuf,

        /// Bytes per read call
        #[arg(long, default_value = "4194304")]
        block_size: u64,
    },

    /// Show file state
    Stat { path: String },

    /// Write cached and staged chunks back to the parallel file system
    Flush { path: String },

    /// Unlink a file
    Rm { path: String },

    /// Prefetch a range into worker staging
    Stage {
        path: String,

        #[arg(long, default_value = "0")]
        offset: u64,

        #[arg(long)]
        size: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "debug" } else { "warn" };
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
    config.validate()?;

    if config.store.backend == StoreBackend::Memory {
        anyhow::bail!("the CLI needs a shared store; set [store] backend = \"redis\"");
    }

    let store = StoreHandle::connect(&config.store)
        .await
        .context("Failed to connect to store")?;
    let client = BurstClient::new(store, &config);

    match cli.command {
        Commands::Put {
            local,
            path,
            block_size,
            flush,
        } => {
            let mut file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("Failed to open {}", local.display()))?;
            client.open(&path, OpenMode::Write).await?;

            let mut offset = 0u64;
            let mut block = vec![0u8; block_size.max(1)];
            loop {
                let n = file.read(&mut block).await?;
                if n == 0 {
                    break;
                }
                offset += client
                    .write(&path, Bytes::copy_from_slice(&block[..n]), offset)
                    .await?;
            }
            client.close(&path).await?;
            info!(path = %path, bytes = offset, "Put complete");

            if flush {
                client.flush(&path).await?;
            }
            println!("{} bytes -> {}", offset, path);
        }

        Commands::Get {
            path,
            local,
            block_size,
        } => {
            if client.open(&path, OpenMode::Read).await?.is_none() {
                anyhow::bail!("No such file: {}", path);
            }
            let mut out = tokio::fs::File::create(&local).await?;
            let mut offset = 0u64;
            loop {
                let data = client.read(&path, offset, block_size.max(1)).await?;
                if data.is_empty() {
                    break;
                }
                out.write_all(&data).await?;
                offset += data.len() as u64;
            }
            out.flush().await?;
            client.close(&path).await?;
            println!("{} bytes <- {}", offset, path);
        }

        Commands::Stat { path } => match client.stat(&path).await? {
            Some(stat) => {
                println!("handle:  {}", stat.handle);
                println!("size:    {}", stat.size);
                println!("pointer: {}", stat.pointer);
                println!("mode:    {:?}", stat.mode);
                println!("open:    {}", stat.is_open);
            }
            None => println!("{}: not found", path),
        },

        Commands::Flush { path } => {
            let tasks = client.flush(&path).await?;
            println!("{}: {} chunks flushed", path, tasks);
        }

        Commands::Rm { path } => {
            if !client.unlink(&path).await? {
                anyhow::bail!("No such file: {}", path);
            }
        }

        Commands::Stage { path, offset, size } => {
            let task_id = client.stage_in(&path, offset, size).await?;
            println!("{}: staged by task {}", path, task_id);
        }
    }

    Ok(())
}
