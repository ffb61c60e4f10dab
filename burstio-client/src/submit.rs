//! Task submission
//!
//! Publishes built tasks to a scheduler shard and waits on their
//! completion markers.

use burstio_core::error::{BurstError, Result};
use burstio_core::{Task, TaskId};
use burstio_storage::{QueueName, StoreHandle, TaskOutcome};
use std::time::Duration;
use tracing::{debug, warn};

/// Publishes tasks to the central queue
#[derive(Clone)]
pub struct Submitter {
    store: StoreHandle,
    shards: usize,
    timeout: Duration,
}

impl Submitter {
    pub fn new(store: StoreHandle, shards: usize, timeout: Duration) -> Self {
        Self {
            store,
            shards: shards.max(1),
            timeout,
        }
    }

    /// Scheduler shard a task is routed to
    pub fn shard_of(&self, task_id: TaskId) -> usize {
        (task_id.0 % self.shards as u64) as usize
    }

    /// Publish one task to its shard's queue
    pub async fn publish(&self, task: &Task) -> Result<()> {
        let queue = QueueName::Scheduler(self.shard_of(task.task_id));
        self.store.queue.publish(queue, task).await?;
        debug!(task_id = %task.task_id, kind = %task.kind, %queue, "Task submitted");
        Ok(())
    }

    /// Publish every task flagged for publication, returning the ids the
    /// caller has to wait on
    pub async fn publish_all(&self, tasks: &[Task]) -> Result<Vec<TaskId>> {
        let mut waiting = Vec::new();
        for task in tasks.iter().filter(|t| t.publish) {
            self.publish(task).await?;
            if !task.is_async {
                waiting.push(task.task_id);
            }
        }
        Ok(waiting)
    }

    /// Wait for a task's completion marker, consuming it
    pub async fn wait(&self, task_id: TaskId) -> Result<()> {
        match self.store.completions.wait(task_id, self.timeout).await? {
            Some(TaskOutcome::Done) => Ok(()),
            Some(TaskOutcome::Failed(reason)) => {
                warn!(%task_id, %reason, "Task failed");
                Err(BurstError::TaskFailed {
                    task_id: task_id.0,
                    reason,
                })
            }
            None => Err(BurstError::CompletionTimeout { task_id: task_id.0 }),
        }
    }

    /// Wait for every task, reporting the first failure
    pub async fn wait_all(&self, task_ids: &[TaskId]) -> Result<()> {
        let mut first_err = None;
        for &task_id in task_ids {
            if let Err(e) = self.wait(task_id).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstio_core::{File, Location, TaskKind};

    fn make_task(id: u64, publish: bool, is_async: bool) -> Task {
        let mut task = Task::new(
            TaskKind::Write,
            TaskId(id),
            File::new(Location::Cache, format!("f#{}", id), 0, 10),
            File::new(Location::Buffers, "f", 0, 10),
        );
        task.publish = publish;
        task.is_async = is_async;
        task
    }

    #[tokio::test]
    async fn test_publish_routes_by_shard() {
        let store = StoreHandle::memory();
        let submitter = Submitter::new(store.clone(), 2, Duration::from_millis(50));

        let waiting = submitter
            .publish_all(&[make_task(3, true, false), make_task(4, false, false), make_task(6, true, true)])
            .await
            .unwrap();
        assert_eq!(waiting, vec![TaskId(3)]);
        assert_eq!(store.queue.len(QueueName::Scheduler(1)).await.unwrap(), 1);
        assert_eq!(store.queue.len(QueueName::Scheduler(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_outcomes() {
        let store = StoreHandle::memory();
        let submitter = Submitter::new(store.clone(), 1, Duration::from_millis(50));

        store.completions.signal(TaskId(1), TaskOutcome::Done).await.unwrap();
        store
            .completions
            .signal(TaskId(2), TaskOutcome::Failed("disk full".into()))
            .await
            .unwrap();

        submitter.wait(TaskId(1)).await.unwrap();
        assert!(matches!(
            submitter.wait(TaskId(2)).await,
            Err(BurstError::TaskFailed { task_id: 2, .. })
        ));
        assert!(matches!(
            submitter.wait(TaskId(1)).await,
            Err(BurstError::CompletionTimeout { task_id: 1 })
        ));
    }
}
