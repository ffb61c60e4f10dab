//! Store capability traits
//!
//! Defines the interfaces every store backend must follow. Values cross the
//! store as opaque bytes; `encode`/`decode` apply the bincode convention
//! shared by all burstio processes.

use async_trait::async_trait;
use burstio_core::error::Result;
use burstio_core::{Task, TaskId, WorkerId};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named tables of the shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Logical filename -> `FileStat`
    FileStat,
    /// Logical filename -> `FileMeta` chunk ring
    FileChunk,
    /// Chunk key -> `ChunkMeta`
    Chunk,
    /// Worker id -> published score (`f64`)
    WorkerScore,
    /// Worker id -> remaining capacity (`u64`)
    WorkerCapacity,
    /// Task id -> `TaskOutcome`, for networked completion boards
    WriteFinished,
    /// Monotonic counters
    Counter,
    /// Chunk key -> raw payload bytes
    Payload,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::FileStat,
        Table::FileChunk,
        Table::Chunk,
        Table::WorkerScore,
        Table::WorkerCapacity,
        Table::WriteFinished,
        Table::Counter,
        Table::Payload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::FileStat => "file_stat",
            Table::FileChunk => "file_chunk",
            Table::Chunk => "chunk",
            Table::WorkerScore => "worker_score",
            Table::WorkerCapacity => "worker_capacity",
            Table::WriteFinished => "write_finished",
            Table::Counter => "counter",
            Table::Payload => "payload",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A FIFO queue of tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Central queue of one scheduler shard
    Scheduler(usize),
    /// Queue of one worker
    Worker(WorkerId),
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Scheduler(shard) => write!(f, "scheduler:{}", shard),
            QueueName::Worker(id) => write!(f, "worker:{}", id),
        }
    }
}

/// Completion markers nobody waits for expire after this long
pub const OUTCOME_TTL: Duration = Duration::from_secs(3600);

/// How a task ended, as seen by whoever waits on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Done,
    Failed(String),
}

impl TaskOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done)
    }
}

/// Key/value tables with counters and compare-and-swap
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value, replacing any previous one
    async fn put(&self, table: Table, key: &str, value: Bytes) -> Result<()>;

    /// Retrieve a value
    async fn get(&self, table: Table, key: &str) -> Result<Option<Bytes>>;

    /// Remove a value, returning whether it existed
    async fn remove(&self, table: Table, key: &str) -> Result<bool>;

    /// Check if a key exists
    async fn exists(&self, table: Table, key: &str) -> Result<bool>;

    /// Set a counter if it does not exist yet, returning its current value
    async fn counter_init(&self, key: &str, value: u64) -> Result<u64>;

    /// Increment a counter, returning the new value (first call yields 1)
    async fn counter_inc(&self, key: &str) -> Result<u64>;

    /// Atomically replace `expected` with `new`. `None` as expected means
    /// "absent"; `None` as new removes the key. Returns false on mismatch.
    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> Result<bool>;
}

/// Named FIFO queues with single-consumer pop
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task to a queue
    async fn publish(&self, queue: QueueName, task: &Task) -> Result<()>;

    /// Pop the oldest task, waiting at most `timeout`. `None` on timeout.
    async fn pop(&self, queue: QueueName, timeout: Duration) -> Result<Option<Task>>;

    /// Number of queued tasks
    async fn len(&self, queue: QueueName) -> Result<usize>;
}

/// Completion signalling keyed by task id
#[async_trait]
pub trait CompletionBoard: Send + Sync {
    /// Record the outcome of a task and wake its waiter
    async fn signal(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()>;

    /// Wait for a task's outcome, consuming it. `None` on timeout.
    async fn wait(&self, task_id: TaskId, timeout: Duration) -> Result<Option<TaskOutcome>>;
}

/// Encode a value for the store
pub fn encode<V: Serialize>(value: &V) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode a value read from the store
pub fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    Ok(bincode::deserialize(bytes)?)
}
