//! burstio Client
//!
//! Entry points an interception shim calls for virtualized paths, and the
//! task builders behind them.
//!
//! # Example
//!
//! ```ignore
//! use burstio_client::BurstClient;
//! use burstio_core::{BurstConfig, OpenMode};
//! use burstio_storage::StoreHandle;
//!
//! let config = BurstConfig::load_or_default("burstio.toml").with_env_overrides();
//! let store = StoreHandle::connect(&config.store).await?;
//! let client = BurstClient::new(store, &config);
//!
//! client.open("burst://out/ckpt.bin", OpenMode::Write).await?;
//! client.write("burst://out/ckpt.bin", data, 0).await?;
//! client.close("burst://out/ckpt.bin").await?;
//! ```

pub mod aggregate;
pub mod builder;
pub mod client;
pub mod submit;

pub use aggregate::AggregatingBuilder;
pub use builder::{BuildContext, DefaultBuilder, TaskBuilder};
pub use client::BurstClient;
pub use submit::Submitter;
