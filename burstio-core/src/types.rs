//! Task and file data model
//!
//! These values are owned by whichever component currently holds them
//! (builder, scheduler, worker) and cross process boundaries through the
//! store, encoded with bincode.

use crate::error::{BurstError, Result};
use crate::placement::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a byte range currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Location {
    /// Payload table of the shared store
    #[default]
    Cache,
    /// Staging directory of a worker
    Buffers,
    /// Backing parallel file system
    Pfs,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Cache => write!(f, "cache"),
            Location::Buffers => write!(f, "buffers"),
            Location::Pfs => write!(f, "pfs"),
        }
    }
}

/// A byte range at a named location
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct File {
    pub location: Location,
    pub filename: String,
    pub offset: u64,
    pub size: u64,
    pub worker: Option<WorkerId>,
    pub server: Option<u32>,
}

impl File {
    pub fn new(location: Location, filename: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            location,
            filename: filename.into(),
            offset,
            size,
            worker: None,
            server: None,
        }
    }

    /// Pin this range to a worker
    pub fn on_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Intersection of this range with `[start, end)`, if any
    pub fn intersect(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let lo = self.offset.max(start);
        let hi = self.end().min(end);
        (lo < hi).then_some((lo, hi))
    }
}

/// Maps a user-visible byte range to its physical placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub actual_user_chunk: File,
    pub destination: File,
}

impl ChunkMeta {
    pub fn new(actual_user_chunk: File, destination: File) -> Self {
        Self {
            actual_user_chunk,
            destination,
        }
    }
}

/// How a file was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// `r`: read only, pointer at start
    #[default]
    Read,
    /// `r+`: read and write, pointer at start
    ReadWrite,
    /// `w`/`w+`: truncate on open
    Write,
    /// `a`/`a+`: pointer at end
    Append,
}

impl OpenMode {
    /// Parse an fopen-style mode string
    pub fn from_fopen(mode: &str) -> Option<Self> {
        let base: String = mode.chars().filter(|c| *c != 'b').collect();
        match base.as_str() {
            "r" => Some(OpenMode::Read),
            "r+" => Some(OpenMode::ReadWrite),
            "w" | "w+" => Some(OpenMode::Write),
            "a" | "a+" => Some(OpenMode::Append),
            _ => None,
        }
    }

    /// Whether opening a missing file in this mode creates it
    pub fn creates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::Append)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Per-file open state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub handle: u64,
    pub size: u64,
    pub pointer: u64,
    pub mode: OpenMode,
    pub is_open: bool,
}

/// What a task asks a worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Write,
    Read,
    Delete,
    Flush,
    Stage,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Write => "write",
            TaskKind::Read => "read",
            TaskKind::Delete => "delete",
            TaskKind::Flush => "flush",
            TaskKind::Stage => "stage",
        };
        f.write_str(name)
    }
}

/// I/O client implementation a task is executed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoBackend {
    #[default]
    Posix,
    Stdio,
}

impl std::str::FromStr for IoBackend {
    type Err = BurstError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "posix" => Ok(IoBackend::Posix),
            "stdio" => Ok(IoBackend::Stdio),
            other => Err(BurstError::Configuration(format!(
                "unknown I/O backend: {}",
                other
            ))),
        }
    }
}

/// Task identifier, allocated from a store counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work moved from a builder through the scheduler to a worker.
///
/// Field use by kind:
/// - `Write`: `source` is the payload key in the cache, `destination` the
///   logical file range.
/// - `Read`: `source` is where the bytes live, `destination` the payload
///   key the worker fills, carrying the logical range it answers.
/// - `Delete`: `source` is the staged chunk on its worker.
/// - `Flush`: `source` is the cached or staged chunk, `destination` the
///   logical range on the parallel file system.
/// - `Stage`: `source` is a parallel file system range to prefetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub backend: IoBackend,
    pub task_id: TaskId,
    pub publish: bool,
    pub add_payload: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub source: File,
    pub destination: File,
    pub meta_updated: bool,
    pub local_copy: bool,
    pub check_fs: bool,
}

impl Task {
    pub fn new(kind: TaskKind, task_id: TaskId, source: File, destination: File) -> Self {
        Self {
            kind,
            backend: IoBackend::default(),
            task_id,
            publish: true,
            add_payload: false,
            is_async: false,
            source,
            destination,
            meta_updated: false,
            local_copy: false,
            check_fs: false,
        }
    }

    /// Bytes moved by this task, used as the knapsack weight
    pub fn size(&self) -> u64 {
        match self.kind {
            TaskKind::Write | TaskKind::Flush => self.source.size,
            TaskKind::Read | TaskKind::Stage => self.source.size.max(self.destination.size),
            TaskKind::Delete => 0,
        }
    }

    /// Worker this task must run on, if its data already lives on one
    pub fn pinned_worker(&self) -> Option<WorkerId> {
        match self.kind {
            TaskKind::Write | TaskKind::Stage => self.destination.worker,
            TaskKind::Read | TaskKind::Delete | TaskKind::Flush => self.source.worker,
        }
    }

    /// Logical file this task belongs to
    pub fn logical_name(&self) -> &str {
        match self.kind {
            TaskKind::Write | TaskKind::Flush => &self.destination.filename,
            TaskKind::Read | TaskKind::Stage | TaskKind::Delete => &self.source.filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_intersect() {
        let f = File::new(Location::Cache, "a", 100, 50);
        assert_eq!(f.intersect(0, 120), Some((100, 120)));
        assert_eq!(f.intersect(140, 200), Some((140, 150)));
        assert_eq!(f.intersect(150, 200), None);
        assert_eq!(f.intersect(0, 100), None);
    }

    #[test]
    fn test_open_mode_parse() {
        assert_eq!(OpenMode::from_fopen("rb"), Some(OpenMode::Read));
        assert_eq!(OpenMode::from_fopen("r+"), Some(OpenMode::ReadWrite));
        assert_eq!(OpenMode::from_fopen("wb+"), Some(OpenMode::Write));
        assert_eq!(OpenMode::from_fopen("a"), Some(OpenMode::Append));
        assert_eq!(OpenMode::from_fopen("x"), None);
        assert!(OpenMode::Write.creates());
        assert!(!OpenMode::ReadWrite.creates());
    }

    #[test]
    fn test_io_backend_parse() {
        assert_eq!("posix".parse::<IoBackend>().unwrap(), IoBackend::Posix);
        assert_eq!("STDIO".parse::<IoBackend>().unwrap(), IoBackend::Stdio);
        assert!(matches!(
            "uring".parse::<IoBackend>(),
            Err(BurstError::Configuration(_))
        ));
    }

    #[test]
    fn test_pinned_worker() {
        let staged = File::new(Location::Buffers, "f#1", 0, 10).on_worker(3);
        let read = Task::new(
            TaskKind::Read,
            TaskId(1),
            staged.clone(),
            File::new(Location::Cache, "f#r1", 0, 10),
        );
        assert_eq!(read.pinned_worker(), Some(3));

        let write = Task::new(
            TaskKind::Write,
            TaskId(2),
            staged,
            File::new(Location::Buffers, "f", 0, 10),
        );
        assert_eq!(write.pinned_worker(), None);
    }

    #[test]
    fn test_task_bincode() {
        let task = Task::new(
            TaskKind::Flush,
            TaskId(9),
            File::new(Location::Cache, "f#2", 0, 4096),
            File::new(Location::Pfs, "f", 8192, 4096),
        );
        let bytes = bincode::serialize(&task).unwrap();
        let back: Task = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, task);
    }
}
