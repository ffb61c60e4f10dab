//! Configuration management for burstio
//!
//! Supports loading from TOML files and `BURSTIO_*` environment variables.
//! Priority: CLI flags > environment > file > defaults.

use crate::error::{BurstError, Result};
use crate::types::IoBackend;
use crate::{CHUNK_LIMIT, MAX_IO_UNIT, MIN_IO_UNIT};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Complete burstio configuration shared by clients, schedulers and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurstConfig {
    #[serde(default)]
    pub io: IoSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl BurstConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BurstConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `BURSTIO_*` environment variables
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment, test fixtures)
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }
        fn flag(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
            lookup(key).map(|v| v == "true" || v == "1")
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "BURSTIO_MAX_IO_UNIT") {
            self.io.max_io_unit = v;
        }
        if let Some(v) = parsed(lookup, "BURSTIO_MIN_IO_UNIT") {
            self.io.min_io_unit = v;
        }
        if let Some(v) = parsed(lookup, "BURSTIO_CHUNK_LIMIT") {
            self.io.chunk_limit = v;
        }
        if let Some(v) = flag(lookup, "BURSTIO_CHECK_FS") {
            self.io.check_fs = v;
        }
        if let Some(v) = flag(lookup, "BURSTIO_ASYNC_WRITES") {
            self.io.async_writes = v;
        }
        if let Some(v) = flag(lookup, "BURSTIO_LOCAL_COPY") {
            self.io.local_copy = v;
        }
        if let Some(v) = lookup("BURSTIO_PFS_ROOT") {
            self.io.pfs_root = PathBuf::from(v);
        }
        if let Some(v) = parsed(lookup, "BURSTIO_SHARDS") {
            self.scheduler.shards = v;
        }
        if let Some(v) = parsed(lookup, "BURSTIO_SOLVER") {
            self.scheduler.solver = v;
        }
        if let Some(v) = parsed(lookup, "BURSTIO_WORKERS") {
            self.worker.count = v;
        }
        if let Some(v) = lookup("BURSTIO_STAGING_DIR") {
            self.worker.staging_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(lookup, "BURSTIO_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Some(v) = lookup("BURSTIO_STORE_URL") {
            self.store.url = v;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.io.max_io_unit == 0 {
            return Err(BurstError::Configuration(
                "max_io_unit cannot be 0".to_string(),
            ));
        }
        if self.io.min_io_unit > self.io.max_io_unit {
            return Err(BurstError::Configuration(format!(
                "min_io_unit ({}) exceeds max_io_unit ({})",
                self.io.min_io_unit, self.io.max_io_unit
            )));
        }
        if self.io.chunk_limit == 0 {
            return Err(BurstError::Configuration(
                "chunk_limit cannot be 0".to_string(),
            ));
        }
        if self.worker.count == 0 {
            return Err(BurstError::Configuration(
                "worker count cannot be 0".to_string(),
            ));
        }
        if self.scheduler.shards == 0 || self.scheduler.max_batch == 0 {
            return Err(BurstError::Configuration(
                "scheduler shards and max_batch must be positive".to_string(),
            ));
        }
        if self.worker.batch_size == 0 {
            return Err(BurstError::Configuration(
                "worker batch_size cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Task builder flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderKind {
    #[default]
    Default,
    Aggregating,
}

/// Client-side I/O settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSettings {
    /// Largest chunk a write is cut into
    #[serde(default = "default_max_io_unit")]
    pub max_io_unit: u64,

    /// Aggregation threshold; chunks at least this large are published
    #[serde(default = "default_min_io_unit")]
    pub min_io_unit: u64,

    /// Capacity of the per-file chunk ring
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,

    /// Look at the parallel file system when a file is unknown
    #[serde(default)]
    pub check_fs: bool,

    /// Return from writes without waiting for workers
    #[serde(default)]
    pub async_writes: bool,

    #[serde(default)]
    pub builder: BuilderKind,

    /// Root of the parallel file system
    #[serde(default = "default_pfs_root")]
    pub pfs_root: PathBuf,

    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_ms: u64,

    #[serde(default)]
    pub default_backend: IoBackend,

    /// Compare-and-swap attempts before giving up on a ring update
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,

    /// Keep a staged copy of data read from the parallel file system
    #[serde(default)]
    pub local_copy: bool,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            max_io_unit: default_max_io_unit(),
            min_io_unit: default_min_io_unit(),
            chunk_limit: default_chunk_limit(),
            check_fs: false,
            async_writes: false,
            builder: BuilderKind::Default,
            pfs_root: default_pfs_root(),
            completion_timeout_ms: default_completion_timeout(),
            default_backend: IoBackend::Posix,
            cas_retries: default_cas_retries(),
            local_copy: false,
        }
    }
}

impl IoSettings {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Path of a logical file on the parallel file system.
    ///
    /// Names that climb out of `pfs_root` through `..` are rejected.
    pub fn pfs_path(&self, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename.trim_start_matches('/'));
        if relative.components().any(|c| c == Component::ParentDir) {
            return Err(BurstError::InvalidArgument(format!(
                "{} escapes the parallel file system root",
                filename
            )));
        }
        Ok(self.pfs_root.join(relative))
    }
}

fn default_max_io_unit() -> u64 {
    MAX_IO_UNIT
}

fn default_min_io_unit() -> u64 {
    MIN_IO_UNIT
}

fn default_chunk_limit() -> usize {
    CHUNK_LIMIT
}

fn default_pfs_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_completion_timeout() -> u64 {
    30_000
}

fn default_cas_retries() -> u32 {
    64
}

/// Placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    #[default]
    Knapsack,
    RoundRobin,
    Random,
    Default,
}

impl FromStr for SolverKind {
    type Err = BurstError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "knapsack" | "dp" => Ok(SolverKind::Knapsack),
            "round_robin" => Ok(SolverKind::RoundRobin),
            "random" => Ok(SolverKind::Random),
            "default" => Ok(SolverKind::Default),
            other => Err(BurstError::Configuration(format!("unknown solver: {}", other))),
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Number of scheduler shards (central queues)
    #[serde(default = "default_shards")]
    pub shards: usize,

    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    #[serde(default = "default_schedule_timer")]
    pub max_schedule_timer_ms: u64,

    #[serde(default = "default_pop_timeout")]
    pub task_pop_timeout_ms: u64,

    #[serde(default)]
    pub solver: SolverKind,

    /// Upper bound on workers the knapsack solver may use (defaults to all)
    #[serde(default)]
    pub max_workers_per_batch: Option<usize>,

    /// Search nodes the multiple-knapsack routine may expand per attempt
    #[serde(default = "default_node_limit")]
    pub knapsack_node_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            max_batch: default_max_batch(),
            max_schedule_timer_ms: default_schedule_timer(),
            task_pop_timeout_ms: default_pop_timeout(),
            solver: SolverKind::Knapsack,
            max_workers_per_batch: None,
            knapsack_node_limit: default_node_limit(),
        }
    }
}

impl SchedulerSettings {
    pub fn max_schedule_timer(&self) -> Duration {
        Duration::from_millis(self.max_schedule_timer_ms)
    }

    pub fn task_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.task_pop_timeout_ms)
    }
}

fn default_shards() -> usize {
    1
}

fn default_max_batch() -> usize {
    16
}

fn default_schedule_timer() -> u64 {
    1000
}

fn default_pop_timeout() -> u64 {
    100
}

fn default_node_limit() -> usize {
    100_000
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Tasks pulled per loop iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Score/capacity republish interval
    #[serde(default = "default_worker_interval")]
    pub interval_ms: u64,

    /// Tasks processed before an early republish
    #[serde(default = "default_max_task_count")]
    pub max_task_count: usize,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Staging capacity in bytes
    #[serde(default = "default_total_capacity")]
    pub total_capacity: u64,

    /// Energy rating, 0 to 5
    #[serde(default = "default_rating")]
    pub energy: u32,

    /// Speed rating, 0 to 5
    #[serde(default = "default_rating")]
    pub speed: u32,

    /// Queue length treated as fully loaded
    #[serde(default = "default_queue_depth")]
    pub max_queue_depth: usize,

    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            batch_size: default_batch_size(),
            interval_ms: default_worker_interval(),
            max_task_count: default_max_task_count(),
            staging_dir: default_staging_dir(),
            total_capacity: default_total_capacity(),
            energy: default_rating(),
            speed: default_rating(),
            max_queue_depth: default_queue_depth(),
            pop_timeout_ms: default_pop_timeout(),
        }
    }
}

impl WorkerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    /// Staging directory of one worker
    pub fn staging_dir_for(&self, worker: u32) -> PathBuf {
        self.staging_dir.join(format!("worker-{}", worker))
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_batch_size() -> usize {
    1
}

fn default_worker_interval() -> u64 {
    2000
}

fn default_max_task_count() -> usize {
    50
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("burstio")
}

fn default_total_capacity() -> u64 {
    128 * 1024 * 1024 * 1024 // 128 GiB
}

fn default_rating() -> u32 {
    2
}

fn default_queue_depth() -> usize {
    1024
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sled,
    Redis,
}

impl StoreBackend {
    /// Whether separate processes see the same queues and completions.
    /// Sled keeps those in process and locks its database file.
    pub fn is_shared(&self) -> bool {
        matches!(self, StoreBackend::Redis)
    }
}

impl FromStr for StoreBackend {
    type Err = BurstError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sled" => Ok(StoreBackend::Sled),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(BurstError::Configuration(format!(
                "unknown store backend: {}",
                other
            ))),
        }
    }
}

/// Shared store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Sled database directory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Key prefix for networked backends
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: default_store_url(),
            path: default_store_path(),
            prefix: default_prefix(),
        }
    }
}

fn default_store_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./burstio_meta")
}

fn default_prefix() -> String {
    "burstio".to_string()
}
