//! burstio Store Client
//!
//! Capability interfaces over the shared store every burstio process talks to:
//! - `KvStore` for named tables, counters and compare-and-swap
//! - `TaskQueue` for the central and per-worker FIFO queues
//! - `CompletionBoard` for blocking task completion signals
//!
//! Implementations:
//! - `MemoryStore` for tests and single-process deployments
//! - `SledStore` for persistent single-host metadata
//! - `RedisStore` for multi-process deployments

pub mod backend;
pub mod handle;
pub mod memory;
pub mod redis_backend;
pub mod sled_backend;

pub use backend::{
    decode, encode, CompletionBoard, KvStore, QueueName, Table, TaskOutcome, TaskQueue,
    OUTCOME_TTL,
};
pub use handle::{StoreHandle, DATASPACE_COUNTER, TASK_ID_COUNTER};
pub use memory::MemoryStore;
pub use redis_backend::RedisStore;
pub use sled_backend::SledStore;
