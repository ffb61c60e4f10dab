//! Worker loop
//!
//! A worker pops tasks from its own queue, executes them against the I/O
//! client named by each task, signals the outcome to whoever waits on the
//! task and periodically republishes its score and free capacity.

use crate::io_client::{IoClient, IoClients};
use crate::score::ScoreInputs;
use crate::staging::Staging;
use burstio_core::error::{BurstError, Result};
use burstio_core::{
    chunk_key, BurstConfig, ChunkMeta, File, IoSettings, Location, Task, TaskKind, WorkerId,
    WorkerSettings,
};
use burstio_metadata::MetadataManager;
use burstio_storage::{encode, QueueName, StoreHandle, Table, TaskOutcome};
use bytes::Bytes;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Score and capacity a worker published
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishedStatus {
    pub score: Option<u32>,
    pub capacity: u64,
}

/// Executes tasks for one worker queue
pub struct Worker {
    id: WorkerId,
    store: StoreHandle,
    metadata: MetadataManager,
    settings: WorkerSettings,
    io: IoSettings,
    clients: IoClients,
    staging: Staging,
}

impl Worker {
    /// Prepare the staging directory and build a worker
    pub async fn start(id: WorkerId, store: StoreHandle, config: &BurstConfig) -> Result<Self> {
        let staging = Staging::prepare(config.worker.staging_dir_for(id)).await?;
        Ok(Self {
            id,
            metadata: MetadataManager::new(store.clone(), &config.io),
            store,
            settings: config.worker.clone(),
            io: config.io.clone(),
            clients: IoClients::new(),
            staging,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = QueueName::Worker(self.id);
        let interval = self.settings.interval();
        let pop_timeout = self.settings.pop_timeout();
        let batch_size = self.settings.batch_size.max(1);

        self.publish_status(true).await?;
        info!(worker = self.id, staging = %self.staging.root().display(), "Worker started");

        let mut processed = 0usize;
        let mut last_publish = Instant::now();

        'outer: while !shutdown.is_cancelled() {
            for _ in 0..batch_size {
                let popped = tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    popped = self.store.queue.pop(queue, pop_timeout) => popped,
                };
                match popped {
                    Ok(Some(task)) => {
                        self.process(task).await;
                        processed += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(worker = self.id, error = %e, "Worker queue pop failed");
                        tokio::time::sleep(pop_timeout).await;
                        break;
                    }
                }
            }

            if last_publish.elapsed() >= interval || processed >= self.settings.max_task_count {
                if let Err(e) = self.publish_status(true).await {
                    warn!(worker = self.id, error = %e, "Status publish failed");
                }
                last_publish = Instant::now();
                processed = 0;
            }
        }

        if let Err(e) = self.publish_status(false).await {
            warn!(worker = self.id, error = %e, "Final status publish failed");
        }
        info!(worker = self.id, "Worker stopped");
        Ok(())
    }

    /// Execute one task and signal its outcome unless it is async
    pub async fn process(&self, task: Task) -> TaskOutcome {
        let outcome = match self.execute(&task).await {
            Ok(()) => TaskOutcome::Done,
            Err(e) => {
                warn!(worker = self.id, task_id = %task.task_id, kind = %task.kind, error = %e, "Task failed");
                TaskOutcome::Failed(e.to_string())
            }
        };

        if !task.is_async {
            if let Err(e) = self
                .store
                .completions
                .signal(task.task_id, outcome.clone())
                .await
            {
                warn!(worker = self.id, task_id = %task.task_id, error = %e, "Completion signal failed");
            }
        }
        outcome
    }

    #[instrument(skip(self, task), fields(worker = self.id, task_id = %task.task_id, kind = %task.kind))]
    pub async fn execute(&self, task: &Task) -> Result<()> {
        let client = self.clients.get(task.backend);
        match task.kind {
            TaskKind::Write => self.write_chunk(client, task).await,
            TaskKind::Read => self.read_chunk(client, task).await,
            TaskKind::Flush => self.flush_chunk(client, task).await,
            TaskKind::Delete => self.delete_chunk(client, task).await,
            TaskKind::Stage => self.stage_range(client, task).await,
        }
    }

    // =========================================================================
    // TASK KINDS
    // =========================================================================

    /// Move a cached chunk into staging and repoint its ring entry
    async fn write_chunk(&self, client: &dyn IoClient, task: &Task) -> Result<()> {
        let key = &task.source.filename;
        let Some(data) = self.cached_slice(&task.source).await? else {
            return Ok(());
        };

        let path = self.staging.path_for(key);
        client.write(&path, 0, &data).await?;
        let placement = File::new(Location::Buffers, key.clone(), 0, data.len() as u64).on_worker(self.id);

        if !task.meta_updated {
            let user = File::new(
                Location::Buffers,
                task.destination.filename.clone(),
                task.destination.offset,
                task.destination.size,
            );
            let evicted = self
                .metadata
                .append_chunk(&task.destination.filename, ChunkMeta::new(user, placement))
                .await?;
            self.release(evicted).await?;
        } else if !self
            .metadata
            .relocate_chunk(&task.destination.filename, key, placement)
            .await?
        {
            // The chunk was evicted or unlinked while queued
            debug!(key = %key, "Dropping staged copy of a released chunk");
            client.delete(&path).await?;
        }

        if task.add_payload {
            self.store.kv.remove(Table::Payload, key).await?;
        }
        debug!(key = %key, bytes = data.len(), "Chunk staged");
        Ok(())
    }

    /// Read a range into the cache under the destination key
    async fn read_chunk(&self, client: &dyn IoClient, task: &Task) -> Result<()> {
        let src = &task.source;
        let data = match src.location {
            Location::Buffers => self.read_staged(client, src).await?,
            Location::Pfs => {
                let data = client.read(&self.io.pfs_path(&src.filename)?, src.offset, src.size).await?;
                if (data.len() as u64) < src.size {
                    debug!(file = %src.filename, expected = src.size, actual = data.len(), "Short read from parallel file system");
                }
                data
            }
            Location::Cache => match self.cached_slice(src).await? {
                Some(data) => data,
                None => Bytes::new(),
            },
        };

        self.store
            .kv
            .put(Table::Payload, &task.destination.filename, data.clone())
            .await?;

        if task.local_copy && src.location == Location::Pfs && !data.is_empty() {
            self.keep_local_copy(client, src, data).await?;
        }
        Ok(())
    }

    /// Write a cached or staged chunk back to the parallel file system
    async fn flush_chunk(&self, client: &dyn IoClient, task: &Task) -> Result<()> {
        let src = &task.source;
        let dst = &task.destination;
        let data = match src.location {
            Location::Cache => match self.cached_slice(src).await? {
                Some(data) => data,
                None => return Ok(()),
            },
            Location::Buffers => self.read_staged(client, src).await?,
            Location::Pfs => return Ok(()),
        };

        let len = (dst.size as usize).min(data.len());
        let target = self.io.pfs_path(&dst.filename)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        client.write(&target, dst.offset, &data[..len]).await?;
        debug!(file = %dst.filename, offset = dst.offset, bytes = len, "Chunk flushed");
        Ok(())
    }

    /// Remove a staged chunk file
    async fn delete_chunk(&self, client: &dyn IoClient, task: &Task) -> Result<()> {
        let src = &task.source;
        if src.location != Location::Buffers {
            debug!(location = %src.location, "Nothing staged to delete");
            return Ok(());
        }
        let existed = client.delete(&self.staging.path_for(&src.filename)).await?;
        debug!(key = %src.filename, existed, "Staged chunk deleted");
        Ok(())
    }

    /// Prefetch a parallel file system range into staging
    async fn stage_range(&self, client: &dyn IoClient, task: &Task) -> Result<()> {
        let src = &task.source;
        let key = &task.destination.filename;
        let path = self.staging.path_for(key);

        let staged = client
            .stage(&self.io.pfs_path(&src.filename)?, src.offset, src.size, &path)
            .await?;
        if staged == 0 {
            client.delete(&path).await?;
            return Ok(());
        }

        let chunk = ChunkMeta::new(
            File::new(Location::Pfs, src.filename.clone(), src.offset, staged),
            File::new(Location::Buffers, key.clone(), 0, staged).on_worker(self.id),
        );
        let evicted = self.metadata.append_chunk(&src.filename, chunk).await?;
        self.release(evicted).await?;
        info!(file = %src.filename, offset = src.offset, bytes = staged, "Range staged");
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Slice of a cached payload. `None` when the payload is gone because
    /// its chunk was released; an error when it should still exist.
    async fn cached_slice(&self, file: &File) -> Result<Option<Bytes>> {
        let key = &file.filename;
        let Some(payload) = self.store.kv.get(Table::Payload, key).await? else {
            if self.metadata.chunk_placement(key).await?.is_none() {
                debug!(key = %key, "Payload of a released chunk, skipping");
                return Ok(None);
            }
            return Err(BurstError::Internal(format!("payload missing for chunk {}", key)));
        };

        let start = (file.offset as usize).min(payload.len());
        let end = (start + file.size as usize).min(payload.len());
        Ok(Some(payload.slice(start..end)))
    }

    async fn read_staged(&self, client: &dyn IoClient, file: &File) -> Result<Bytes> {
        if file.worker.is_some_and(|w| w != self.id) {
            return Err(BurstError::Internal(format!(
                "chunk {} is staged on worker {:?}, not {}",
                file.filename, file.worker, self.id
            )));
        }
        let data = client
            .read(&self.staging.path_for(&file.filename), file.offset, file.size)
            .await?;
        if (data.len() as u64) < file.size {
            return Err(BurstError::PartialIo {
                expected: file.size,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Stage data read from the parallel file system and record it as the
    /// newest placement of its range
    async fn keep_local_copy(&self, client: &dyn IoClient, src: &File, data: Bytes) -> Result<()> {
        let key = chunk_key(&src.filename, self.store.next_dataspace_id().await?);
        client.write(&self.staging.path_for(&key), 0, &data).await?;

        let len = data.len() as u64;
        let chunk = ChunkMeta::new(
            File::new(Location::Pfs, src.filename.clone(), src.offset, len),
            File::new(Location::Buffers, key, 0, len).on_worker(self.id),
        );
        let evicted = self.metadata.append_chunk(&src.filename, chunk).await?;
        self.release(evicted).await
    }

    /// Free whatever backed an evicted ring entry
    async fn release(&self, evicted: Option<ChunkMeta>) -> Result<()> {
        let Some(chunk) = evicted else {
            return Ok(());
        };
        let placement = chunk.destination;
        match (placement.location, placement.worker) {
            (Location::Cache, _) => {
                self.store.kv.remove(Table::Payload, &placement.filename).await?;
            }
            (Location::Buffers, Some(worker)) if worker == self.id => {
                self.clients
                    .get(self.io.default_backend)
                    .delete(&self.staging.path_for(&placement.filename))
                    .await?;
            }
            (Location::Buffers, Some(worker)) => {
                let task_id = self.store.next_task_id().await?;
                let mut delete = Task::new(TaskKind::Delete, task_id, placement, File::default());
                delete.is_async = true;
                self.store.queue.publish(QueueName::Worker(worker), &delete).await?;
            }
            (Location::Buffers, None) => {
                warn!(key = %placement.filename, "Evicted staged chunk has no worker");
            }
            (Location::Pfs, _) => {}
        }
        Ok(())
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    /// Staging capacity left
    pub async fn remaining_capacity(&self) -> Result<u64> {
        let used = self.staging.used_bytes().await?;
        Ok(self.settings.total_capacity.saturating_sub(used))
    }

    /// Recompute and publish score and capacity
    pub async fn publish_status(&self, alive: bool) -> Result<PublishedStatus> {
        let queue_len = self.store.queue.len(QueueName::Worker(self.id)).await?;
        let capacity = self.remaining_capacity().await?;
        let inputs = ScoreInputs {
            queue_len,
            max_queue_depth: self.settings.max_queue_depth,
            remaining_capacity: capacity,
            total_capacity: self.settings.total_capacity,
            alive,
            energy: self.settings.energy,
            speed: self.settings.speed,
        };

        let key = self.id.to_string();
        let score = inputs.score().filter(|s| *s > 0);
        if let Some(score) = score {
            self.store
                .kv
                .put(Table::WorkerScore, &key, encode(&(score as f64))?)
                .await?;
        }
        self.store
            .kv
            .put(Table::WorkerCapacity, &key, encode(&capacity)?)
            .await?;

        debug!(worker = self.id, ?score, capacity, queue_len, "Status published");
        Ok(PublishedStatus { score, capacity })
    }
}
