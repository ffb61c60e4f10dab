//! Task builders
//!
//! A builder turns one logical read or write into chunk-sized tasks.
//! Writes store each chunk's payload under its chunk key and record the
//! placement in the file's chunk ring before the tasks are handed back;
//! reads resolve the ring into one task per contiguous placement.

use async_trait::async_trait;
use burstio_core::error::Result;
use burstio_core::{chunk_key, split_range, ChunkMeta, File, IoSettings, Location, Task, TaskKind};
use burstio_metadata::MetadataManager;
use burstio_storage::{StoreHandle, Table};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Turns logical requests into tasks
#[async_trait]
pub trait TaskBuilder: Send + Sync {
    /// Build chunk tasks for a write.
    ///
    /// `task.destination` is the logical range written and `payload` holds
    /// exactly its bytes. Tasks with `publish` set must cross the central
    /// queue; the others are already resolved in the cache.
    async fn build_write(&self, task: Task, payload: Bytes) -> Result<Vec<Task>>;

    /// Build one task per placement of the range in `task.source`
    async fn build_read(&self, task: Task) -> Result<Vec<Task>>;

    /// Publish any buffered data and wait for it
    async fn close_aggregation(&self) -> Result<()> {
        Ok(())
    }
}

/// State shared by the builders
#[derive(Clone)]
pub struct BuildContext {
    pub store: StoreHandle,
    pub metadata: Arc<MetadataManager>,
    pub io: IoSettings,
}

impl BuildContext {
    pub fn new(store: StoreHandle, metadata: Arc<MetadataManager>, io: IoSettings) -> Self {
        Self { store, metadata, io }
    }

    /// Release placements that no longer back any byte of a file.
    ///
    /// Cached payloads are dropped here; staged chunks need their worker,
    /// so a `Delete` task pinned to it is returned instead.
    pub async fn release(&self, chunks: Vec<ChunkMeta>) -> Result<Vec<Task>> {
        let mut deletes = Vec::new();
        for chunk in chunks {
            let placement = chunk.destination;
            match placement.location {
                Location::Cache => {
                    self.store.kv.remove(Table::Payload, &placement.filename).await?;
                }
                Location::Buffers => {
                    let task_id = self.store.next_task_id().await?;
                    let mut delete = Task::new(TaskKind::Delete, task_id, placement, File::default());
                    delete.is_async = true;
                    deletes.push(delete);
                }
                Location::Pfs => {}
            }
        }
        Ok(deletes)
    }
}

/// Cuts writes into `max_io_unit` chunks
pub struct DefaultBuilder {
    ctx: BuildContext,
}

impl DefaultBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    fn should_publish(&self, len: u64) -> bool {
        len == self.ctx.io.max_io_unit || len >= self.ctx.io.min_io_unit
    }
}

#[async_trait]
impl TaskBuilder for DefaultBuilder {
    #[instrument(skip(self, task, payload), fields(file = %task.destination.filename, size = task.destination.size))]
    async fn build_write(&self, task: Task, payload: Bytes) -> Result<Vec<Task>> {
        let ctx = &self.ctx;
        let name = task.destination.filename.clone();
        let base = task.destination.offset;
        let pieces = split_range(base, task.destination.size, ctx.io.max_io_unit);

        let mut tasks = Vec::with_capacity(pieces.len());
        let mut garbage = Vec::new();

        for (offset, len) in pieces {
            let key = chunk_key(&name, ctx.store.next_dataspace_id().await?);
            let start = (offset - base) as usize;
            ctx.store
                .kv
                .put(Table::Payload, &key, payload.slice(start..start + len as usize))
                .await?;

            let task_id = ctx.store.next_task_id().await?;
            let mut sub = Task::new(
                TaskKind::Write,
                task_id,
                File::new(Location::Cache, key, 0, len),
                File::new(Location::Buffers, name.clone(), offset, len),
            );
            sub.backend = task.backend;
            sub.is_async = task.is_async;
            sub.check_fs = task.check_fs;
            sub.add_payload = true;
            sub.publish = self.should_publish(len);

            let evicted = ctx.metadata.update_write_task_info(&sub).await?;
            sub.meta_updated = true;
            garbage.extend(ctx.release(evicted).await?);
            tasks.push(sub);
        }

        debug!(chunks = tasks.len(), garbage = garbage.len(), "Write built");
        tasks.extend(garbage);
        Ok(tasks)
    }

    #[instrument(skip(self, task), fields(file = %task.source.filename, offset = task.source.offset, size = task.source.size))]
    async fn build_read(&self, task: Task) -> Result<Vec<Task>> {
        let ctx = &self.ctx;
        let name = &task.source.filename;
        let chunks = ctx
            .metadata
            .fetch_chunks(name, task.source.offset, task.source.size)
            .await?;

        let mut tasks = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let task_id = ctx.store.next_task_id().await?;
            let user = chunk.actual_user_chunk;
            let mut sub = Task::new(
                TaskKind::Read,
                task_id,
                chunk.destination,
                File::new(
                    Location::Cache,
                    format!("{}#read{}", name, task_id),
                    user.offset,
                    user.size,
                ),
            );
            sub.backend = task.backend;
            sub.check_fs = task.check_fs;
            sub.publish = sub.source.location != Location::Cache;
            sub.local_copy = task.local_copy && sub.source.location == Location::Pfs;
            tasks.push(sub);
        }
        Ok(tasks)
    }
}
