//! Aggregating task builder
//!
//! Small writes are buffered in process until the running aggregate
//! reaches `min_io_unit`, a write lands somewhere other than the end of the
//! aggregate, or another file is written. Closing the aggregate builds a
//! single chunk for the buffered range, pushes it through the central queue
//! and waits for the worker to finish it.

use crate::builder::{BuildContext, DefaultBuilder, TaskBuilder};
use crate::submit::Submitter;
use async_trait::async_trait;
use burstio_core::error::Result;
use burstio_core::{File, IoBackend, Location, Task, TaskId, TaskKind};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, instrument};

/// Contiguous bytes waiting to be published
#[derive(Debug)]
struct Aggregate {
    filename: String,
    start: u64,
    backend: IoBackend,
    buf: BytesMut,
}

impl Aggregate {
    fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    fn continues(&self, filename: &str, offset: u64) -> bool {
        self.filename == filename && self.end() == offset
    }
}

/// Coalesces writes smaller than `min_io_unit`
pub struct AggregatingBuilder {
    inner: DefaultBuilder,
    submitter: Submitter,
    pending: Mutex<Option<Aggregate>>,
}

impl AggregatingBuilder {
    pub fn new(ctx: BuildContext, submitter: Submitter) -> Self {
        Self {
            inner: DefaultBuilder::new(ctx),
            submitter,
            pending: Mutex::new(None),
        }
    }

    fn min_io_unit(&self) -> u64 {
        self.inner.context().io.min_io_unit
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> u64 {
        self.pending.lock().as_ref().map_or(0, |a| a.buf.len() as u64)
    }

    /// Build, publish and wait for one aggregate
    #[instrument(skip(self, aggregate), fields(file = %aggregate.filename, start = aggregate.start, size = aggregate.buf.len()))]
    async fn publish(&self, aggregate: Aggregate) -> Result<()> {
        let size = aggregate.buf.len() as u64;
        let mut task = Task::new(
            TaskKind::Write,
            TaskId::default(),
            File::new(Location::Cache, aggregate.filename.clone(), 0, size),
            File::new(Location::Buffers, aggregate.filename, aggregate.start, size),
        );
        task.backend = aggregate.backend;

        let mut tasks = self.inner.build_write(task, aggregate.buf.freeze()).await?;
        for sub in tasks.iter_mut().filter(|t| t.kind == TaskKind::Write) {
            sub.publish = true;
            sub.is_async = false;
        }

        let waiting = self.submitter.publish_all(&tasks).await?;
        debug!(tasks = waiting.len(), "Aggregate published");
        self.submitter.wait_all(&waiting).await
    }
}

#[async_trait]
impl TaskBuilder for AggregatingBuilder {
    async fn build_write(&self, task: Task, payload: Bytes) -> Result<Vec<Task>> {
        if task.destination.size >= self.min_io_unit() {
            self.close_aggregation().await?;
            return self.inner.build_write(task, payload).await;
        }

        let name = &task.destination.filename;
        let (broken, full) = {
            let mut pending = self.pending.lock();
            let breaks = pending
                .as_ref()
                .is_some_and(|agg| !agg.continues(name, task.destination.offset));
            let broken = if breaks { pending.take() } else { None };

            let agg = pending.get_or_insert_with(|| Aggregate {
                filename: name.clone(),
                start: task.destination.offset,
                backend: task.backend,
                buf: BytesMut::with_capacity(self.min_io_unit() as usize),
            });
            agg.buf.extend_from_slice(&payload);

            let full = if agg.buf.len() as u64 >= self.min_io_unit() {
                pending.take()
            } else {
                None
            };
            (broken, full)
        };

        // Older bytes first so overlapping writes keep last-write-wins
        if let Some(agg) = broken {
            self.publish(agg).await?;
        }
        if let Some(agg) = full {
            self.publish(agg).await?;
        }
        Ok(Vec::new())
    }

    async fn build_read(&self, task: Task) -> Result<Vec<Task>> {
        self.close_aggregation().await?;
        self.inner.build_read(task).await
    }

    async fn close_aggregation(&self) -> Result<()> {
        let pending = self.pending.lock().take();
        match pending {
            Some(agg) => self.publish(agg).await,
            None => Ok(()),
        }
    }
}
