//! Client entry points
//!
//! The calls an interception shim forwards: open, create, close, seek,
//! read and write on virtualized paths, plus flush, unlink and stage-in.
//! Paths may carry the `burst://` prefix; it is stripped before any
//! metadata lookup.

use crate::aggregate::AggregatingBuilder;
use crate::builder::{BuildContext, DefaultBuilder, TaskBuilder};
use crate::submit::Submitter;
use burstio_core::error::{BurstError, Result};
use burstio_core::{
    chunk_key, strip_virtual_prefix, BuilderKind, BurstConfig, File, FileStat, IoSettings, Location,
    OpenMode, Task, TaskId, TaskKind,
};
use burstio_metadata::{MetadataManager, Whence};
use burstio_storage::{StoreHandle, Table};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Passes over a read before a vanished cache payload is zero-filled
const READ_RESOLVE_PASSES: usize = 2;

/// burstio client
pub struct BurstClient {
    store: StoreHandle,
    metadata: Arc<MetadataManager>,
    ctx: BuildContext,
    builder: Box<dyn TaskBuilder>,
    submitter: Submitter,
    io: IoSettings,
}

impl BurstClient {
    /// Create a client over a store handle
    pub fn new(store: StoreHandle, config: &BurstConfig) -> Self {
        let io = config.io.clone();
        let metadata = Arc::new(MetadataManager::new(store.clone(), &io));
        let ctx = BuildContext::new(store.clone(), metadata.clone(), io.clone());
        let submitter = Submitter::new(store.clone(), config.scheduler.shards, io.completion_timeout());

        let builder: Box<dyn TaskBuilder> = match io.builder {
            BuilderKind::Default => Box::new(DefaultBuilder::new(ctx.clone())),
            BuilderKind::Aggregating => {
                Box::new(AggregatingBuilder::new(ctx.clone(), submitter.clone()))
            }
        };

        Self {
            store,
            metadata,
            ctx,
            builder,
            submitter,
            io,
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Stat of a file, `None` if unknown
    pub async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        self.metadata.stat(strip_virtual_prefix(path)).await
    }

    /// Open a file.
    ///
    /// Unknown files are created by creating modes, or adopted from the
    /// parallel file system in read modes when `check_fs` is set. Returns
    /// `None` when the file exists nowhere.
    #[instrument(skip(self))]
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<Option<FileStat>> {
        let name = strip_virtual_prefix(path);

        if let Some(opened) = self.metadata.update_on_open(name, mode).await? {
            let garbage = self.ctx.release(opened.truncated).await?;
            self.submitter.publish_all(&garbage).await?;
            return Ok(Some(opened.stat));
        }

        if mode.creates() {
            return self.metadata.create(name, mode, 0).await.map(Some);
        }

        if self.io.check_fs {
            if let Ok(meta) = tokio::fs::metadata(self.io.pfs_path(name)?).await {
                debug!(name, size = meta.len(), "Adopting file from parallel file system");
                return self.metadata.create(name, mode, meta.len()).await.map(Some);
            }
        }

        Ok(None)
    }

    /// Create an empty file opened for writing
    pub async fn create(&self, path: &str) -> Result<FileStat> {
        self.metadata
            .create(strip_virtual_prefix(path), OpenMode::Write, 0)
            .await
    }

    /// Close a file, publishing any aggregated bytes first
    pub async fn close(&self, path: &str) -> Result<bool> {
        self.builder.close_aggregation().await?;
        self.metadata.update_on_close(strip_virtual_prefix(path)).await
    }

    /// Move the pointer. `origin` is `SEEK_SET`, `SEEK_CUR` or `SEEK_END`.
    pub async fn seek(&self, path: &str, offset: i64, origin: i32) -> Result<Option<u64>> {
        let whence = Whence::from_raw(origin)?;
        self.builder.close_aggregation().await?;
        self.metadata
            .update_on_seek(strip_virtual_prefix(path), offset, whence)
            .await
    }

    /// Write `data` at `offset`, returning the bytes written
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn write(&self, path: &str, data: Bytes, offset: u64) -> Result<u64> {
        let name = strip_virtual_prefix(path);
        if !self.metadata.is_opened(name).await? {
            return Err(BurstError::NotOpened(name.to_string()));
        }
        let count = data.len() as u64;
        if count == 0 {
            return Ok(0);
        }

        let mut task = Task::new(
            TaskKind::Write,
            self.store.next_task_id().await?,
            File::new(Location::Cache, name, 0, count),
            File::new(Location::Buffers, name, offset, count),
        );
        task.backend = self.io.default_backend;
        task.is_async = self.io.async_writes;
        task.check_fs = self.io.check_fs;

        let tasks = self.builder.build_write(task, data).await?;
        let waiting = self.submitter.publish_all(&tasks).await?;
        self.metadata.update_on_write(name, offset, count).await?;

        self.submitter.wait_all(&waiting).await?;
        debug!(name, offset, count, tasks = tasks.len(), "Write complete");
        Ok(count)
    }

    /// Read up to `count` bytes at `offset`.
    ///
    /// Reads past the end are clamped. An unopened file reads as empty
    /// unless `check_fs` is set, in which case it is an error.
    #[instrument(skip(self))]
    pub async fn read(&self, path: &str, offset: u64, count: u64) -> Result<Bytes> {
        let name = strip_virtual_prefix(path);
        if !self.metadata.is_opened(name).await? {
            if self.io.check_fs {
                return Err(BurstError::NotOpened(name.to_string()));
            }
            return Ok(Bytes::new());
        }

        self.builder.close_aggregation().await?;
        let size = self.metadata.file_size(name).await?;
        let count = count.min(size.saturating_sub(offset));
        if count == 0 {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::zeroed(count as usize);
        let mut ranges = vec![(offset, count)];

        for pass in 0..READ_RESOLVE_PASSES {
            let mut missing = Vec::new();
            for (start, len) in ranges {
                missing.extend(self.read_range(name, offset, start, len, &mut buf).await?);
            }
            if missing.is_empty() {
                break;
            }
            if pass + 1 == READ_RESOLVE_PASSES {
                warn!(name, ranges = missing.len(), "Cached chunks vanished during read");
            }
            ranges = missing;
        }

        self.metadata.update_on_read(name, count).await?;
        Ok(buf.freeze())
    }

    /// Fill `[start, start + len)` of a read whose buffer begins at `base`.
    /// Returns the ranges whose cached payload disappeared while resolving.
    async fn read_range(
        &self,
        name: &str,
        base: u64,
        start: u64,
        len: u64,
        buf: &mut BytesMut,
    ) -> Result<Vec<(u64, u64)>> {
        let mut task = Task::new(
            TaskKind::Read,
            self.store.next_task_id().await?,
            File::new(Location::Pfs, name, start, len),
            File::new(Location::Cache, name, start, len),
        );
        task.backend = self.io.default_backend;
        task.check_fs = self.io.check_fs;
        task.local_copy = self.io.local_copy;

        let subs = self.builder.build_read(task).await?;
        let mut missing = Vec::new();
        let mut published = Vec::new();
        let mut first_err = None;

        for sub in subs {
            match self.start_sub_read(&sub, base, buf, &mut missing).await {
                Ok(true) => published.push(sub),
                Ok(false) => {}
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            }
        }

        // Every published sub-read is waited on and its payload dropped,
        // even after a failure
        for sub in published {
            let key = &sub.destination.filename;
            match self.submitter.wait(sub.task_id).await {
                Ok(()) if first_err.is_none() => {
                    match self.store.kv.get(Table::Payload, key).await {
                        Ok(Some(payload)) => {
                            let at = (sub.destination.offset - base) as usize;
                            copy_into(buf, at, &payload, 0, sub.destination.size);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            first_err.get_or_insert(e);
                        }
                    }
                }
                Ok(()) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = self.store.kv.remove(Table::Payload, key).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(missing),
        }
    }

    /// Serve a sub-read from the cache or publish it.
    /// Returns true when the sub-read was published and must be waited on.
    async fn start_sub_read(
        &self,
        sub: &Task,
        base: u64,
        buf: &mut BytesMut,
        missing: &mut Vec<(u64, u64)>,
    ) -> Result<bool> {
        if !sub.publish {
            let src = &sub.source;
            let at = (sub.destination.offset - base) as usize;
            match self.store.kv.get(Table::Payload, &src.filename).await? {
                Some(payload) => copy_into(buf, at, &payload, src.offset, src.size),
                None => missing.push((sub.destination.offset, sub.destination.size)),
            }
            return Ok(false);
        }

        let pfs_miss = sub.source.location == Location::Pfs
            && tokio::fs::metadata(self.io.pfs_path(&sub.source.filename)?)
                .await
                .is_err();
        if pfs_miss {
            debug!(file = %sub.source.filename, offset = sub.destination.offset, "Unwritten range reads as zeros");
            return Ok(false);
        }

        self.submitter.publish(sub).await?;
        Ok(true)
    }

    /// Write every cached or staged byte of a file back to the parallel
    /// file system. Returns the number of flush tasks run.
    #[instrument(skip(self))]
    pub async fn flush(&self, path: &str) -> Result<usize> {
        let name = strip_virtual_prefix(path);
        self.builder.close_aggregation().await?;
        let size = self.metadata.file_size(name).await?;

        let mut tasks = Vec::new();
        for chunk in self.metadata.fetch_chunks(name, 0, size).await? {
            if chunk.destination.location == Location::Pfs {
                continue;
            }
            let user = chunk.actual_user_chunk;
            let mut task = Task::new(
                TaskKind::Flush,
                self.store.next_task_id().await?,
                chunk.destination,
                File::new(Location::Pfs, name, user.offset, user.size),
            );
            task.backend = self.io.default_backend;
            tasks.push(task);
        }

        let waiting = self.submitter.publish_all(&tasks).await?;
        self.submitter.wait_all(&waiting).await?;
        info!(name, tasks = tasks.len(), "File flushed");
        Ok(tasks.len())
    }

    /// Forget a file and release everything it placed. False if unknown.
    #[instrument(skip(self))]
    pub async fn unlink(&self, path: &str) -> Result<bool> {
        let name = strip_virtual_prefix(path);
        self.builder.close_aggregation().await?;
        if !self.metadata.is_created(name).await? {
            return Ok(false);
        }

        let chunks = self.metadata.remove(name).await?;
        let deletes = self.ctx.release(chunks).await?;
        self.submitter.publish_all(&deletes).await?;
        info!(name, deletes = deletes.len(), "File unlinked");
        Ok(true)
    }

    /// Prefetch a range of a parallel file system file into worker staging
    #[instrument(skip(self))]
    pub async fn stage_in(&self, path: &str, offset: u64, size: u64) -> Result<TaskId> {
        let name = strip_virtual_prefix(path);
        let key = chunk_key(name, self.store.next_dataspace_id().await?);
        let mut task = Task::new(
            TaskKind::Stage,
            self.store.next_task_id().await?,
            File::new(Location::Pfs, name, offset, size),
            File::new(Location::Buffers, key, 0, size),
        );
        task.backend = self.io.default_backend;

        self.submitter.publish(&task).await?;
        self.submitter.wait(task.task_id).await?;
        Ok(task.task_id)
    }
}

/// Copy `len` bytes of `payload` starting at `from` into `buf` at `at`,
/// tolerating short payloads
fn copy_into(buf: &mut BytesMut, at: usize, payload: &[u8], from: u64, len: u64) {
    let from = (from as usize).min(payload.len());
    let end = (from + len as usize).min(payload.len());
    let src = &payload[from..end];
    let room = buf.len().saturating_sub(at).min(src.len());
    buf[at..at + room].copy_from_slice(&src[..room]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstio_storage::{MemoryStore, QueueName, TaskOutcome};
    use std::time::Duration;

    fn make_client(config: BurstConfig) -> BurstClient {
        BurstClient::new(StoreHandle::memory(), &config)
    }

    fn small_unit_config() -> BurstConfig {
        let mut config = BurstConfig::default();
        config.io.min_io_unit = 1 << 20;
        config
    }

    #[tokio::test]
    async fn test_open_modes() {
        let client = make_client(BurstConfig::default());
        assert!(client.open("burst://f", OpenMode::Read).await.unwrap().is_none());

        let stat = client.open("burst://f", OpenMode::Write).await.unwrap().unwrap();
        assert!(stat.is_open);
        assert!(client.close("f").await.unwrap());
        assert!(client.open("burst://f", OpenMode::Read).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let client = make_client(BurstConfig::default());
        let err = client.write("f", Bytes::from_static(b"abc"), 0).await.unwrap_err();
        assert!(matches!(err, BurstError::NotOpened(_)));
    }

    #[tokio::test]
    async fn test_read_unopened() {
        let client = make_client(BurstConfig::default());
        assert!(client.read("f", 0, 10).await.unwrap().is_empty());

        let mut config = BurstConfig::default();
        config.io.check_fs = true;
        config.io.pfs_root = std::env::temp_dir().join("burstio-nonexistent-root");
        let client = make_client(config);
        assert!(matches!(
            client.read("f", 0, 10).await,
            Err(BurstError::NotOpened(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_round_trip() {
        // Everything below min_io_unit stays in the cache, no worker needed
        let client = make_client(small_unit_config());
        client.open("f", OpenMode::Write).await.unwrap();

        let written = client.write("f", Bytes::from_static(b"hello world"), 0).await.unwrap();
        assert_eq!(written, 11);
        client.write("f", Bytes::from_static(b"W"), 6).await.unwrap();

        let data = client.read("f", 0, 100).await.unwrap();
        assert_eq!(&data[..], b"hello World");
        assert_eq!(client.metadata().file_pointer("f").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_sync_write_waits_for_worker() {
        let mut config = BurstConfig::default();
        config.io.min_io_unit = 4;
        config.io.completion_timeout_ms = 2000;
        let client = make_client(config);
        client.open("f", OpenMode::Write).await.unwrap();

        let store = client.store().clone();
        let worker = tokio::spawn(async move {
            let task = store
                .queue
                .pop(QueueName::Scheduler(0), Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            store.completions.signal(task.task_id, TaskOutcome::Done).await.unwrap();
            task
        });

        client.write("f", Bytes::from_static(b"payload"), 0).await.unwrap();
        let task = worker.await.unwrap();
        assert_eq!(task.kind, TaskKind::Write);
        assert_eq!(task.destination.size, 7);
    }

    #[tokio::test]
    async fn test_seek_invalid_origin() {
        let client = make_client(BurstConfig::default());
        client.open("f", OpenMode::Write).await.unwrap();
        assert!(matches!(
            client.seek("f", 0, 9).await,
            Err(BurstError::InvalidSeekOrigin(9))
        ));
        assert_eq!(client.seek("f", 4, 0).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_unlink_drops_payloads() {
        let client = make_client(small_unit_config());
        client.open("f", OpenMode::Write).await.unwrap();
        client.write("f", Bytes::from_static(b"abc"), 0).await.unwrap();

        assert!(client.unlink("f").await.unwrap());
        assert!(!client.unlink("f").await.unwrap());
        assert!(client.stat("f").await.unwrap().is_none());
        assert!(client
            .metadata()
            .fetch_chunks("f", 0, 3)
            .await
            .unwrap()
            .iter()
            .all(|c| c.destination.location == Location::Pfs));
    }

    #[tokio::test]
    async fn test_failed_sub_read_cleans_up() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = small_unit_config();
        config.io.check_fs = true;
        config.io.pfs_root = temp.path().to_path_buf();
        config.io.completion_timeout_ms = 2000;
        config.scheduler.shards = 1;
        std::fs::write(temp.path().join("f"), vec![7u8; 200]).unwrap();

        let memory = Arc::new(MemoryStore::new());
        let client = BurstClient::new(StoreHandle::from_memory(memory.clone()), &config);
        client.open("f", OpenMode::Read).await.unwrap().unwrap();
        client.write("f", Bytes::from_static(b"0123456789"), 50).await.unwrap();
        let cached = memory.table_len(Table::Payload);

        // Fails the first sub-read and serves the second
        let store = client.store().clone();
        let worker = tokio::spawn(async move {
            for n in 0..2 {
                let task = store
                    .queue
                    .pop(QueueName::Scheduler(0), Duration::from_secs(2))
                    .await
                    .unwrap()
                    .unwrap();
                let outcome = if n == 0 {
                    TaskOutcome::Failed("disk gone".into())
                } else {
                    store
                        .kv
                        .put(Table::Payload, &task.destination.filename, vec![7u8; 140].into())
                        .await
                        .unwrap();
                    TaskOutcome::Done
                };
                store.completions.signal(task.task_id, outcome).await.unwrap();
            }
        });

        let err = client.read("f", 0, 200).await.unwrap_err();
        assert!(matches!(err, BurstError::TaskFailed { .. }));
        worker.await.unwrap();

        assert_eq!(memory.table_len(Table::Payload), cached);
        assert_eq!(memory.pending_outcomes(), 0);
    }

    #[test]
    fn test_copy_into_short_payload() {
        let mut buf = BytesMut::zeroed(6);
        copy_into(&mut buf, 2, b"xyz", 1, 5);
        assert_eq!(&buf[..], &[0, 0, b'y', b'z', 0, 0]);
    }
}
