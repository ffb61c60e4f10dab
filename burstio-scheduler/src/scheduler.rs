//! Task scheduler
//!
//! One scheduler serves one shard of the central queue. It accumulates
//! tasks until the batch is full or the schedule timer expires, solves the
//! batch once and fans the tasks out to the per-worker queues.

use crate::solver::{build_solver, Solver};
use burstio_core::error::Result;
use burstio_core::{
    BurstConfig, SchedulerSettings, SolverInput, Task, TaskId, WorkerId, WorkerStatus,
};
use burstio_storage::{decode, QueueName, StoreHandle, Table, TaskOutcome};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Score assumed for workers that have not published one yet
const UNPUBLISHED_SCORE: f64 = 100.0;

/// Batches tasks from one central queue shard onto worker queues
pub struct TaskScheduler {
    shard: usize,
    store: StoreHandle,
    solver: Box<dyn Solver>,
    settings: SchedulerSettings,
    worker_count: usize,
    default_capacity: u64,
}

impl TaskScheduler {
    /// Create a scheduler using the configured solver
    pub fn new(shard: usize, store: StoreHandle, config: &BurstConfig) -> Self {
        let solver = build_solver(&config.scheduler, &config.worker);
        Self::with_solver(shard, store, config, solver)
    }

    pub fn with_solver(
        shard: usize,
        store: StoreHandle,
        config: &BurstConfig,
        solver: Box<dyn Solver>,
    ) -> Self {
        Self {
            shard,
            store,
            solver,
            settings: config.scheduler.clone(),
            worker_count: config.worker.count,
            default_capacity: config.worker.total_capacity,
        }
    }

    /// Run until `shutdown` is cancelled. A partial batch is dispatched
    /// before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = QueueName::Scheduler(self.shard);
        let timer = self.settings.max_schedule_timer();
        let pop_timeout = self.settings.task_pop_timeout();
        let max_batch = self.settings.max_batch.max(1);

        info!(shard = self.shard, max_batch, ?timer, "Task scheduler started");

        let mut batch: Vec<Task> = Vec::with_capacity(max_batch);
        let mut started = Instant::now();

        while !shutdown.is_cancelled() {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.store.queue.pop(queue, pop_timeout) => popped,
            };

            match popped {
                Ok(Some(task)) => batch.push(task),
                Ok(None) => {}
                Err(e) => {
                    warn!(shard = self.shard, error = %e, "Central queue pop failed");
                    tokio::time::sleep(pop_timeout).await;
                }
            }

            if !batch.is_empty() && (batch.len() >= max_batch || started.elapsed() >= timer) {
                self.dispatch_logged(std::mem::take(&mut batch)).await;
                started = Instant::now();
            }
        }

        if !batch.is_empty() {
            self.dispatch_logged(batch).await;
        }
        info!(shard = self.shard, "Task scheduler stopped");
        Ok(())
    }

    async fn dispatch_logged(&self, batch: Vec<Task>) {
        if let Err(e) = self.dispatch(batch).await {
            error!(shard = self.shard, error = %e, "Batch dispatch failed");
        }
    }

    /// Solve a batch and publish each task to its worker's queue.
    ///
    /// When the batch cannot be placed, or a worker queue rejects a task,
    /// every unpublished task somebody waits on is completed as failed
    /// before the error is returned.
    #[instrument(skip(self, batch), fields(shard = self.shard, batch = batch.len()))]
    pub async fn dispatch(&self, batch: Vec<Task>) -> Result<usize> {
        let waiting: Vec<TaskId> = batch
            .iter()
            .filter(|t| !t.is_async)
            .map(|t| t.task_id)
            .collect();

        let workers = self.worker_statuses().await?;
        let output = match self.solver.solve(SolverInput::new(batch), &workers) {
            Ok(output) => output,
            Err(e) => {
                self.fail_waiters(waiting, &e.to_string()).await?;
                return Err(e);
            }
        };

        let assigned: Vec<(WorkerId, Task)> = output
            .by_worker
            .into_iter()
            .flat_map(|(worker, tasks)| tasks.into_iter().map(move |task| (worker, task)))
            .collect();

        for (index, (worker, task)) in assigned.iter().enumerate() {
            debug!(task_id = %task.task_id, kind = %task.kind, worker, "Task assigned");
            if let Err(e) = self.store.queue.publish(QueueName::Worker(*worker), task).await {
                let stranded = assigned[index..]
                    .iter()
                    .filter(|(_, t)| !t.is_async)
                    .map(|(_, t)| t.task_id)
                    .collect();
                self.fail_waiters(stranded, &e.to_string()).await?;
                return Err(e);
            }
        }
        Ok(assigned.len())
    }

    async fn fail_waiters(&self, task_ids: Vec<TaskId>, reason: &str) -> Result<()> {
        for task_id in task_ids {
            self.store
                .completions
                .signal(task_id, TaskOutcome::Failed(reason.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Score and capacity last published by each worker
    pub async fn worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        let mut workers = Vec::with_capacity(self.worker_count);
        for id in 0..self.worker_count as WorkerId {
            let key = id.to_string();
            let score = match self.store.kv.get(Table::WorkerScore, &key).await? {
                Some(bytes) => decode::<f64>(&bytes)?,
                None => UNPUBLISHED_SCORE,
            };
            let capacity = match self.store.kv.get(Table::WorkerCapacity, &key).await? {
                Some(bytes) => decode::<u64>(&bytes)?,
                None => self.default_capacity,
            };
            workers.push(WorkerStatus { id, score, capacity });
        }
        Ok(workers)
    }
}
