//! burstio Metadata Manager
//!
//! Tracks per-file open state (`FileStat`) and chunk placement history
//! (`FileMeta` rings) in the shared store, and resolves logical byte ranges
//! to the chunks that currently hold them.
//!
//! # Usage
//!
//! ```ignore
//! use burstio_metadata::{MetadataManager, Whence};
//!
//! let metadata = MetadataManager::new(store, &config.io);
//! metadata.create("data/a.bin", OpenMode::Write, 0).await?;
//! metadata.update_write_task_info(&task).await?;
//!
//! // Newest placement wins, gaps fall back to the parallel file system
//! let chunks = metadata.fetch_chunks("data/a.bin", 0, 4096).await?;
//! ```

pub mod manager;
pub mod resolve;

pub use manager::{MetadataManager, Opened, Whence};
pub use resolve::resolve_range;
