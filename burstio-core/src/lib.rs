//! burstio Core Library
//!
//! Shared abstractions for the burstio I/O acceleration layer.
//! This crate provides:
//! - The task and file data model moved between clients, schedulers and workers
//! - The per-file chunk ring buffer (`FileMeta`)
//! - Chunk range arithmetic and chunk key naming
//! - Placement solver input/output types
//! - Configuration and error handling

pub mod chunk;
pub mod config;
pub mod error;
pub mod placement;
pub mod ring;
pub mod types;

pub use chunk::{chunk_key, is_virtual, split_range, strip_virtual_prefix};
pub use config::{
    BuilderKind, BurstConfig, IoSettings, SchedulerSettings, SolverKind, StoreBackend,
    StoreSettings, WorkerSettings,
};
pub use error::{BurstError, Result};
pub use placement::{SolverInput, SolverOutput, WorkerId, WorkerStatus};
pub use ring::FileMeta;
pub use types::{ChunkMeta, File, FileStat, IoBackend, Location, OpenMode, Task, TaskId, TaskKind};

/// Prefix marking a path as virtualized by burstio
pub const VIRTUAL_PREFIX: &str = "burst://";

/// I/O unit constants
pub const MAX_IO_UNIT: u64 = 1024 * 1024; // 1 MiB
pub const MIN_IO_UNIT: u64 = 8 * 1024; // 8 KiB

/// Default capacity of the per-file chunk ring
pub const CHUNK_LIMIT: usize = 1050;
