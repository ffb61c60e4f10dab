//! Metadata manager
//!
//! All state lives in the shared store, keyed by logical filename:
//! - `Table::FileStat`: open state, size and pointer
//! - `Table::FileChunk`: the chunk ring
//! - `Table::Chunk`: latest placement of each chunk key
//!
//! Every read-modify-write goes through a bounded compare-and-swap loop, so
//! concurrent writers to one file never lose a ring append.

use burstio_core::error::{BurstError, Result};
use burstio_core::{ChunkMeta, File, FileMeta, FileStat, IoSettings, Location, OpenMode, Task};
use burstio_storage::{decode, encode, StoreHandle, Table};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::resolve::resolve_range;

/// Counter used to allocate file handles
const FILE_HANDLE_COUNTER: &str = "FILE_HANDLE";

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// Map a `SEEK_SET`/`SEEK_CUR`/`SEEK_END` value
    pub fn from_raw(origin: i32) -> Result<Self> {
        match origin {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            other => Err(BurstError::InvalidSeekOrigin(other)),
        }
    }
}

/// Result of opening a known file
#[derive(Debug, Clone)]
pub struct Opened {
    pub stat: FileStat,
    /// Placements dropped by a truncating open
    pub truncated: Vec<ChunkMeta>,
}

/// Metadata manager
pub struct MetadataManager {
    store: StoreHandle,
    chunk_limit: usize,
    cas_retries: u32,
    /// Handles opened through this process
    handles: RwLock<HashMap<u64, String>>,
}

impl MetadataManager {
    pub fn new(store: StoreHandle, settings: &IoSettings) -> Self {
        Self {
            store,
            chunk_limit: settings.chunk_limit,
            cas_retries: settings.cas_retries.max(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    async fn load<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>> {
        match self.store.kv.get(table, key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-swap update of one stored value.
    ///
    /// `init` seeds a missing value; without it a missing key yields `Ok(None)`.
    /// `f` returning `Ok(None)` leaves the value untouched.
    async fn cas_update<T, R, F>(
        &self,
        table: Table,
        key: &str,
        init: Option<T>,
        mut f: F,
    ) -> Result<Option<R>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
        R: Send,
        F: FnMut(&mut T) -> Result<Option<R>> + Send,
    {
        for attempt in 0..self.cas_retries {
            let current = self.store.kv.get(table, key).await?;
            let mut value: T = match (&current, &init) {
                (Some(bytes), _) => decode(bytes)?,
                (None, Some(seed)) => seed.clone(),
                (None, None) => return Ok(None),
            };

            let Some(result) = f(&mut value)? else {
                return Ok(None);
            };

            let encoded = encode(&value)?;
            if self
                .store
                .kv
                .compare_and_swap(table, key, current.as_deref(), Some(encoded))
                .await?
            {
                return Ok(Some(result));
            }

            debug!(%table, key, attempt, "Concurrent update, retrying");
            tokio::task::yield_now().await;
        }

        warn!(%table, key, attempts = self.cas_retries, "Giving up on contended update");
        Err(BurstError::Contention {
            key: key.to_string(),
            attempts: self.cas_retries,
        })
    }

    // =========================================================================
    // FILE STATE
    // =========================================================================

    /// Get the stat of a file
    pub async fn stat(&self, filename: &str) -> Result<Option<FileStat>> {
        self.load(Table::FileStat, filename).await
    }

    pub async fn is_created(&self, filename: &str) -> Result<bool> {
        self.store.kv.exists(Table::FileStat, filename).await
    }

    pub async fn is_opened(&self, filename: &str) -> Result<bool> {
        Ok(self.stat(filename).await?.is_some_and(|s| s.is_open))
    }

    /// Current size, 0 for unknown files
    pub async fn file_size(&self, filename: &str) -> Result<u64> {
        Ok(self.stat(filename).await?.map_or(0, |s| s.size))
    }

    /// Current pointer, 0 for unknown files
    pub async fn file_pointer(&self, filename: &str) -> Result<u64> {
        Ok(self.stat(filename).await?.map_or(0, |s| s.pointer))
    }

    /// Logical filename behind a handle opened by this process
    pub fn filename_of(&self, handle: u64) -> Option<String> {
        self.handles.read().get(&handle).cloned()
    }

    /// Create a file in the open state
    #[instrument(skip(self))]
    pub async fn create(&self, filename: &str, mode: OpenMode, size: u64) -> Result<FileStat> {
        let handle = self.store.kv.counter_inc(FILE_HANDLE_COUNTER).await?;
        let pointer = if mode == OpenMode::Append { size } else { 0 };
        let stat = FileStat {
            handle,
            size,
            pointer,
            mode,
            is_open: true,
        };

        let created = self
            .store
            .kv
            .compare_and_swap(Table::FileStat, filename, None, Some(encode(&stat)?))
            .await?;
        if !created {
            return Err(BurstError::AlreadyCreated(filename.to_string()));
        }

        self.handles.write().insert(handle, filename.to_string());
        info!(filename, handle, size, "File created");
        Ok(stat)
    }

    /// Reopen a known file. `None` if the file was never created.
    #[instrument(skip(self))]
    pub async fn update_on_open(&self, filename: &str, mode: OpenMode) -> Result<Option<Opened>> {
        let stat = self
            .cas_update(Table::FileStat, filename, None, |stat: &mut FileStat| {
                stat.is_open = true;
                stat.mode = mode;
                match mode {
                    OpenMode::Read | OpenMode::ReadWrite => stat.pointer = 0,
                    OpenMode::Write => {
                        stat.size = 0;
                        stat.pointer = 0;
                    }
                    OpenMode::Append => stat.pointer = stat.size,
                }
                Ok(Some(stat.clone()))
            })
            .await?;

        let Some(stat) = stat else {
            return Ok(None);
        };

        let truncated = if mode == OpenMode::Write {
            self.remove_chunks(filename).await?
        } else {
            Vec::new()
        };

        self.handles.write().insert(stat.handle, filename.to_string());
        debug!(filename, handle = stat.handle, ?mode, "File opened");
        Ok(Some(Opened { stat, truncated }))
    }

    /// Mark a file closed. False for unknown files.
    pub async fn update_on_close(&self, filename: &str) -> Result<bool> {
        let closed = self
            .cas_update(Table::FileStat, filename, None, |stat: &mut FileStat| {
                stat.is_open = false;
                Ok(Some(stat.handle))
            })
            .await?;

        match closed {
            Some(handle) => {
                self.handles.write().remove(&handle);
                debug!(filename, handle, "File closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move the file pointer. `None` for unknown files.
    pub async fn update_on_seek(
        &self,
        filename: &str,
        offset: i64,
        whence: Whence,
    ) -> Result<Option<u64>> {
        self.cas_update(Table::FileStat, filename, None, |stat: &mut FileStat| {
            if !stat.is_open {
                return Err(BurstError::NotOpened(filename.to_string()));
            }
            let target = match whence {
                Whence::Set => Some(offset),
                Whence::Cur => i64::try_from(stat.pointer)
                    .ok()
                    .and_then(|pointer| pointer.checked_add(offset)),
                Whence::End => i64::try_from(stat.size)
                    .ok()
                    .and_then(|size| size.checked_sub(offset)),
            };
            let target = target.ok_or_else(|| {
                BurstError::InvalidArgument(format!(
                    "seek of {} from {:?} overflows in {}",
                    offset, whence, filename
                ))
            })?;
            stat.pointer = target.max(0) as u64;
            Ok(Some(stat.pointer))
        })
        .await
    }

    /// Advance the pointer after a read of `count` bytes
    pub async fn update_on_read(&self, filename: &str, count: u64) -> Result<u64> {
        self.cas_update(Table::FileStat, filename, None, |stat: &mut FileStat| {
            if !stat.is_open {
                return Err(BurstError::NotOpened(filename.to_string()));
            }
            stat.pointer += count;
            Ok(Some(stat.pointer))
        })
        .await?
        .ok_or_else(|| BurstError::NotOpened(filename.to_string()))
    }

    /// Grow the size and move the pointer after a write of `count` bytes at `offset`
    pub async fn update_on_write(&self, filename: &str, offset: u64, count: u64) -> Result<FileStat> {
        self.cas_update(Table::FileStat, filename, None, |stat: &mut FileStat| {
            if !stat.is_open {
                return Err(BurstError::NotOpened(filename.to_string()));
            }
            stat.size = stat.size.max(offset + count);
            stat.pointer = offset + count;
            Ok(Some(stat.clone()))
        })
        .await?
        .ok_or_else(|| BurstError::NotOpened(filename.to_string()))
    }

    // =========================================================================
    // CHUNK PLACEMENT
    // =========================================================================

    /// Chunk ring of a file
    pub async fn file_meta(&self, filename: &str) -> Result<Option<FileMeta>> {
        self.load(Table::FileChunk, filename).await
    }

    /// Latest placement recorded for a chunk key
    pub async fn chunk_placement(&self, chunk_key: &str) -> Result<Option<ChunkMeta>> {
        self.load(Table::Chunk, chunk_key).await
    }

    /// Append a placement to the file's ring, returning the entry it evicted
    #[instrument(skip(self, chunk), fields(key = %chunk.destination.filename))]
    pub async fn append_chunk(&self, filename: &str, chunk: ChunkMeta) -> Result<Option<ChunkMeta>> {
        let seed = FileMeta::new(File::new(Location::Pfs, filename, 0, 0), self.chunk_limit);
        let evicted = self
            .cas_update(Table::FileChunk, filename, Some(seed), |meta: &mut FileMeta| {
                Ok(Some(meta.append(chunk.clone())))
            })
            .await?
            .flatten();

        self.store
            .kv
            .put(Table::Chunk, &chunk.destination.filename, encode(&chunk)?)
            .await?;

        if let Some(old) = &evicted {
            debug!(
                filename,
                evicted = %old.destination.filename,
                location = %old.destination.location,
                "Chunk evicted from ring"
            );
            self.store
                .kv
                .remove(Table::Chunk, &old.destination.filename)
                .await?;
        }
        Ok(evicted)
    }

    /// Record where a write task's chunk now lives.
    ///
    /// Returns placements evicted from the ring; their payloads or staged
    /// files are garbage the caller should release.
    pub async fn update_write_task_info(&self, task: &Task) -> Result<Vec<ChunkMeta>> {
        let user = File::new(
            task.source.location,
            task.destination.filename.clone(),
            task.destination.offset,
            task.destination.size,
        );
        let chunk = ChunkMeta::new(user, task.source.clone());
        let evicted = self.append_chunk(&task.destination.filename, chunk).await?;
        Ok(evicted.into_iter().collect())
    }

    /// Resolve a logical range to its current placements, newest write winning
    pub async fn fetch_chunks(&self, filename: &str, offset: u64, size: u64) -> Result<Vec<ChunkMeta>> {
        let meta = self.file_meta(filename).await?;
        Ok(resolve_range(meta.as_ref(), filename, offset, size))
    }

    /// Point the ring entry holding `chunk_key` at a new placement.
    /// False when the entry is gone (evicted or unlinked).
    #[instrument(skip(self, destination))]
    pub async fn relocate_chunk(
        &self,
        filename: &str,
        chunk_key: &str,
        destination: File,
    ) -> Result<bool> {
        let relocated = self
            .cas_update(Table::FileChunk, filename, None, |meta: &mut FileMeta| {
                let mut moved = None;
                let hit = meta.update_newest(
                    |c| c.destination.filename == chunk_key,
                    |c| {
                        c.destination = destination.clone();
                        moved = Some(c.clone());
                    },
                );
                Ok(if hit { moved } else { None })
            })
            .await?;

        match relocated {
            Some(chunk) => {
                self.store
                    .kv
                    .put(Table::Chunk, chunk_key, encode(&chunk)?)
                    .await?;
                debug!(filename, chunk_key, location = %chunk.destination.location, "Chunk relocated");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop a file's chunk ring, returning the placements it held
    pub async fn remove_chunks(&self, filename: &str) -> Result<Vec<ChunkMeta>> {
        for _ in 0..self.cas_retries {
            let Some(current) = self.store.kv.get(Table::FileChunk, filename).await? else {
                return Ok(Vec::new());
            };
            let mut meta: FileMeta = decode(&current)?;
            if !self
                .store
                .kv
                .compare_and_swap(Table::FileChunk, filename, Some(&current[..]), None)
                .await?
            {
                continue;
            }

            let chunks = meta.drain();
            for chunk in &chunks {
                self.store
                    .kv
                    .remove(Table::Chunk, &chunk.destination.filename)
                    .await?;
            }
            debug!(filename, count = chunks.len(), "Chunk ring removed");
            return Ok(chunks);
        }

        Err(BurstError::Contention {
            key: filename.to_string(),
            attempts: self.cas_retries,
        })
    }

    /// Forget a file entirely, returning the placements it held
    #[instrument(skip(self))]
    pub async fn remove(&self, filename: &str) -> Result<Vec<ChunkMeta>> {
        let chunks = self.remove_chunks(filename).await?;
        if let Some(stat) = self.stat(filename).await? {
            self.handles.write().remove(&stat.handle);
        }
        self.store.kv.remove(Table::FileStat, filename).await?;
        info!(filename, chunks = chunks.len(), "File removed");
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burstio_core::{TaskId, TaskKind};
    use burstio_storage::{KvStore, MemoryStore};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn make_manager() -> MetadataManager {
        MetadataManager::new(StoreHandle::memory(), &IoSettings::default())
    }

    fn make_manager_with_limit(limit: usize) -> MetadataManager {
        let settings = IoSettings {
            chunk_limit: limit,
            ..Default::default()
        };
        MetadataManager::new(StoreHandle::memory(), &settings)
    }

    fn make_write(name: &str, key: &str, offset: u64, size: u64) -> Task {
        Task::new(
            TaskKind::Write,
            TaskId(offset),
            File::new(Location::Cache, key, 0, size),
            File::new(Location::Buffers, name, offset, size),
        )
    }

    #[tokio::test]
    async fn test_create_and_double_create() {
        let metadata = make_manager();
        let stat = metadata.create("f", OpenMode::Write, 0).await.unwrap();
        assert!(stat.is_open);
        assert!(metadata.is_created("f").await.unwrap());
        assert!(metadata.is_opened("f").await.unwrap());
        assert_eq!(metadata.filename_of(stat.handle).as_deref(), Some("f"));

        let err = metadata.create("f", OpenMode::Write, 0).await.unwrap_err();
        assert!(matches!(err, BurstError::AlreadyCreated(_)));
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let metadata = make_manager();
        assert!(!metadata.is_created("nope").await.unwrap());
        assert_eq!(metadata.file_size("nope").await.unwrap(), 0);
        assert!(!metadata.update_on_close("nope").await.unwrap());
        assert!(metadata.update_on_open("nope", OpenMode::Read).await.unwrap().is_none());
        assert!(metadata
            .update_on_seek("nope", 0, Whence::Set)
            .await
            .unwrap()
            .is_none());
        assert!(metadata.fetch_chunks("nope", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_read_pointer() {
        let metadata = make_manager();
        metadata.create("f", OpenMode::Write, 0).await.unwrap();

        let stat = metadata.update_on_write("f", 0, 100).await.unwrap();
        assert_eq!((stat.size, stat.pointer), (100, 100));
        let stat = metadata.update_on_write("f", 10, 20).await.unwrap();
        assert_eq!((stat.size, stat.pointer), (100, 30));

        assert_eq!(metadata.update_on_read("f", 5).await.unwrap(), 35);
    }

    #[tokio::test]
    async fn test_closed_file_rejects_updates() {
        let metadata = make_manager();
        metadata.create("f", OpenMode::Write, 0).await.unwrap();
        assert!(metadata.update_on_close("f").await.unwrap());
        assert!(!metadata.is_opened("f").await.unwrap());

        let err = metadata.update_on_write("f", 0, 1).await.unwrap_err();
        assert!(matches!(err, BurstError::NotOpened(_)));
        let err = metadata.update_on_read("missing", 1).await.unwrap_err();
        assert!(matches!(err, BurstError::NotOpened(_)));
        let err = metadata.update_on_seek("f", 0, Whence::Set).await.unwrap_err();
        assert!(matches!(err, BurstError::NotOpened(_)));
    }

    #[tokio::test]
    async fn test_seek() {
        let metadata = make_manager();
        metadata.create("f", OpenMode::Write, 0).await.unwrap();
        metadata.update_on_write("f", 0, 100).await.unwrap();

        assert_eq!(metadata.update_on_seek("f", 10, Whence::Set).await.unwrap(), Some(10));
        assert_eq!(metadata.update_on_seek("f", 5, Whence::Cur).await.unwrap(), Some(15));
        assert_eq!(metadata.update_on_seek("f", -50, Whence::Cur).await.unwrap(), Some(0));
        assert_eq!(metadata.update_on_seek("f", 30, Whence::End).await.unwrap(), Some(70));

        assert_eq!(metadata.update_on_seek("f", -20, Whence::End).await.unwrap(), Some(120));
        assert!(matches!(Whence::from_raw(2), Ok(Whence::End)));
        assert!(matches!(
            Whence::from_raw(7),
            Err(BurstError::InvalidSeekOrigin(7))
        ));
    }

    #[tokio::test]
    async fn test_seek_overflow_rejected() {
        let metadata = make_manager();
        metadata.create("f", OpenMode::Write, 0).await.unwrap();
        metadata.update_on_write("f", 0, 100).await.unwrap();

        let err = metadata.update_on_seek("f", i64::MIN, Whence::End).await.unwrap_err();
        assert!(matches!(err, BurstError::InvalidArgument(_)));
        let err = metadata.update_on_seek("f", i64::MAX, Whence::Cur).await.unwrap_err();
        assert!(matches!(err, BurstError::InvalidArgument(_)));
        assert_eq!(metadata.file_pointer("f").await.unwrap(), 100);

        // In-range extremes still clamp at zero
        assert_eq!(metadata.update_on_seek("f", i64::MIN, Whence::Cur).await.unwrap(), Some(0));
        assert_eq!(metadata.update_on_seek("f", i64::MAX, Whence::End).await.unwrap(), Some(0));
        assert_eq!(metadata.update_on_seek("f", i64::MIN, Whence::Set).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_open_modes() {
        let metadata = make_manager();
        metadata.create("f", OpenMode::Write, 0).await.unwrap();
        metadata.update_on_write("f", 0, 64).await.unwrap();
        metadata
            .update_write_task_info(&make_write("f", "f#1", 0, 64))
            .await
            .unwrap();
        metadata.update_on_close("f").await.unwrap();

        let opened = metadata.update_on_open("f", OpenMode::Append).await.unwrap().unwrap();
        assert_eq!(opened.stat.pointer, 64);
        assert!(opened.truncated.is_empty());

        let opened = metadata.update_on_open("f", OpenMode::Read).await.unwrap().unwrap();
        assert_eq!(opened.stat.pointer, 0);
        assert_eq!(opened.stat.size, 64);

        let opened = metadata.update_on_open("f", OpenMode::Write).await.unwrap().unwrap();
        assert_eq!(opened.stat.size, 0);
        assert_eq!(opened.truncated.len(), 1);
        assert!(metadata.file_meta("f").await.unwrap().is_none());
        assert!(metadata.chunk_placement("f#1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_task_info_and_fetch() {
        let metadata = make_manager();
        metadata
            .update_write_task_info(&make_write("f", "f#1", 0, 100))
            .await
            .unwrap();
        metadata
            .update_write_task_info(&make_write("f", "f#2", 50, 100))
            .await
            .unwrap();

        let chunks = metadata.fetch_chunks("f", 0, 200).await.unwrap();
        let layout: Vec<(&str, u64, u64)> = chunks
            .iter()
            .map(|c| {
                (
                    c.destination.filename.as_str(),
                    c.actual_user_chunk.offset,
                    c.actual_user_chunk.size,
                )
            })
            .collect();
        assert_eq!(layout, vec![("f#1", 0, 50), ("f#2", 50, 100), ("f", 150, 50)]);
        assert_eq!(chunks[2].destination.location, Location::Pfs);

        let placement = metadata.chunk_placement("f#2").await.unwrap().unwrap();
        assert_eq!(placement.actual_user_chunk.offset, 50);
    }

    #[tokio::test]
    async fn test_ring_eviction_reported() {
        let metadata = make_manager_with_limit(2);
        for i in 0..2 {
            let evicted = metadata
                .update_write_task_info(&make_write("f", &format!("f#{}", i), i * 10, 10))
                .await
                .unwrap();
            assert!(evicted.is_empty());
        }
        let evicted = metadata
            .update_write_task_info(&make_write("f", "f#2", 20, 10))
            .await
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].destination.filename, "f#0");
        assert!(metadata.chunk_placement("f#0").await.unwrap().is_none());

        let meta = metadata.file_meta("f").await.unwrap().unwrap();
        assert_eq!(meta.count(), 2);
        assert!(meta.current_index() < 2);
    }

    #[tokio::test]
    async fn test_relocate_chunk() {
        let metadata = make_manager();
        metadata
            .update_write_task_info(&make_write("f", "f#1", 0, 100))
            .await
            .unwrap();

        let staged = File::new(Location::Buffers, "f#1", 0, 100).on_worker(3);
        assert!(metadata.relocate_chunk("f", "f#1", staged).await.unwrap());
        assert!(!metadata
            .relocate_chunk("f", "f#404", File::default())
            .await
            .unwrap());

        let chunks = metadata.fetch_chunks("f", 10, 10).await.unwrap();
        assert_eq!(chunks[0].destination.location, Location::Buffers);
        assert_eq!(chunks[0].destination.worker, Some(3));
        assert_eq!(chunks[0].destination.offset, 10);

        let placement = metadata.chunk_placement("f#1").await.unwrap().unwrap();
        assert_eq!(placement.destination.worker, Some(3));
    }

    /// Memory store that yields inside `get` and can refuse CAS calls
    struct ContendedKv {
        inner: Arc<MemoryStore>,
        refuse_cas: AtomicU32,
        cas_calls: AtomicU32,
    }

    impl ContendedKv {
        fn new(refuse_cas: u32) -> Self {
            Self {
                inner: Arc::new(MemoryStore::new()),
                refuse_cas: AtomicU32::new(refuse_cas),
                cas_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl KvStore for ContendedKv {
        async fn put(&self, table: Table, key: &str, value: Bytes) -> Result<()> {
            self.inner.put(table, key, value).await
        }

        async fn get(&self, table: Table, key: &str) -> Result<Option<Bytes>> {
            let value = self.inner.get(table, key).await;
            tokio::task::yield_now().await;
            value
        }

        async fn remove(&self, table: Table, key: &str) -> Result<bool> {
            self.inner.remove(table, key).await
        }

        async fn exists(&self, table: Table, key: &str) -> Result<bool> {
            self.inner.exists(table, key).await
        }

        async fn counter_init(&self, key: &str, value: u64) -> Result<u64> {
            self.inner.counter_init(key, value).await
        }

        async fn counter_inc(&self, key: &str) -> Result<u64> {
            self.inner.counter_inc(key).await
        }

        async fn compare_and_swap(
            &self,
            table: Table,
            key: &str,
            expected: Option<&[u8]>,
            new: Option<Bytes>,
        ) -> Result<bool> {
            self.cas_calls.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse_cas
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Ok(false);
            }
            self.inner.compare_and_swap(table, key, expected, new).await
        }
    }

    fn make_contended(kv: Arc<ContendedKv>, cas_retries: u32) -> MetadataManager {
        let local = Arc::new(MemoryStore::new());
        let store = StoreHandle {
            kv,
            queue: local.clone(),
            completions: local,
        };
        let settings = IoSettings {
            cas_retries,
            ..Default::default()
        };
        MetadataManager::new(store, &settings)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_not_lost() {
        let kv = Arc::new(ContendedKv::new(0));
        let metadata = Arc::new(make_contended(kv.clone(), 10_000));
        let mut handles = Vec::new();
        for i in 0..32u64 {
            let metadata = metadata.clone();
            handles.push(tokio::spawn(async move {
                metadata
                    .update_write_task_info(&make_write("f", &format!("f#{}", i), i * 10, 10))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let meta = metadata.file_meta("f").await.unwrap().unwrap();
        assert_eq!(meta.count(), 32);
        for i in 0..32u64 {
            assert!(metadata
                .chunk_placement(&format!("f#{}", i))
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_refused_update_is_retried() {
        let kv = Arc::new(ContendedKv::new(0));
        let metadata = make_contended(kv.clone(), 5);
        metadata.create("f", OpenMode::Write, 0).await.unwrap();

        kv.refuse_cas.store(3, Ordering::SeqCst);
        let before = kv.cas_calls.load(Ordering::SeqCst);
        let stat = metadata.update_on_write("f", 0, 10).await.unwrap();
        assert_eq!(stat.size, 10);
        assert_eq!(kv.cas_calls.load(Ordering::SeqCst) - before, 4);
        assert_eq!(metadata.file_size("f").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_contention_gives_up() {
        let kv = Arc::new(ContendedKv::new(0));
        let metadata = make_contended(kv.clone(), 3);
        metadata.create("f", OpenMode::Write, 0).await.unwrap();

        kv.refuse_cas.store(u32::MAX, Ordering::SeqCst);
        let before = kv.cas_calls.load(Ordering::SeqCst);
        let err = metadata.update_on_write("f", 0, 10).await.unwrap_err();
        assert!(matches!(err, BurstError::Contention { attempts: 3, .. }));
        assert_eq!(kv.cas_calls.load(Ordering::SeqCst) - before, 3);

        kv.refuse_cas.store(0, Ordering::SeqCst);
        assert_eq!(metadata.file_size("f").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let metadata = make_manager();
        let stat = metadata.create("f", OpenMode::Write, 0).await.unwrap();
        metadata
            .update_write_task_info(&make_write("f", "f#1", 0, 10))
            .await
            .unwrap();

        let removed = metadata.remove("f").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!metadata.is_created("f").await.unwrap());
        assert!(metadata.filename_of(stat.handle).is_none());
    }
}
