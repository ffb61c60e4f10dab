//! Error types for burstio
//!
//! Provides a unified error type for all burstio operations. Lookups that
//! find nothing are not errors; they surface as `Option`, `0` or empty
//! collections.

use thiserror::Error;

/// Result type alias for burstio operations
pub type Result<T> = std::result::Result<T, BurstError>;

/// Unified error type for burstio
#[derive(Error, Debug)]
pub enum BurstError {
    // ===== Precondition Errors =====
    #[error("File not opened: {0}")]
    NotOpened(String),

    #[error("File already created: {0}")]
    AlreadyCreated(String),

    #[error("Invalid seek origin: {0}")]
    InvalidSeekOrigin(i32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ===== Scheduling Errors =====
    #[error("No placement solution for {tasks} tasks using up to {max_workers} workers")]
    NoSolution { tasks: usize, max_workers: usize },

    // ===== Task Errors =====
    #[error("Partial I/O: expected {expected} bytes, got {actual}")]
    PartialIo { expected: u64, actual: u64 },

    #[error("Task {task_id} failed: {reason}")]
    TaskFailed { task_id: u64, reason: String },

    #[error("Timed out waiting for completion of task {task_id}")]
    CompletionTimeout { task_id: u64 },

    // ===== Store Errors =====
    #[error("Store error: {0}")]
    Store(String),

    #[error("Too much contention updating {key} ({attempts} attempts)")]
    Contention { key: String, attempts: u32 },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for BurstError {
    fn from(err: bincode::Error) -> Self {
        BurstError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BurstError {
    fn from(err: toml::de::Error) -> Self {
        BurstError::Configuration(err.to_string())
    }
}
