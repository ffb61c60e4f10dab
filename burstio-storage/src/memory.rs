//! In-memory store
//!
//! Implements every store capability inside one process. Used for testing
//! and single-process deployments. Not persistent.

use crate::backend::{
    CompletionBoard, KvStore, QueueName, Table, TaskOutcome, TaskQueue, OUTCOME_TTL,
};
use async_trait::async_trait;
use burstio_core::error::Result;
use burstio_core::{Task, TaskId};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-memory store
pub struct MemoryStore {
    /// Table contents
    tables: RwLock<HashMap<Table, HashMap<String, Bytes>>>,

    counters: Mutex<HashMap<String, u64>>,

    queues: Mutex<HashMap<QueueName, VecDeque<Task>>>,
    queue_notify: Notify,

    /// Outcomes with the time they were signalled
    outcomes: Mutex<HashMap<TaskId, (TaskOutcome, Instant)>>,
    outcome_notify: Notify,
    outcome_ttl: Duration,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_outcome_ttl(OUTCOME_TTL)
    }

    /// Create an empty store whose unclaimed outcomes expire after `ttl`
    pub fn with_outcome_ttl(ttl: Duration) -> Self {
        let tables = Table::ALL
            .iter()
            .map(|table| (*table, HashMap::new()))
            .collect();

        Self {
            tables: RwLock::new(tables),
            counters: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            queue_notify: Notify::new(),
            outcomes: Mutex::new(HashMap::new()),
            outcome_notify: Notify::new(),
            outcome_ttl: ttl,
        }
    }

    /// Number of keys in a table
    pub fn table_len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, HashMap::len)
    }

    /// Number of outcomes signalled but not yet consumed
    pub fn pending_outcomes(&self) -> usize {
        self.outcomes.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, table: Table, key: &str, value: Bytes) -> Result<()> {
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Bytes>> {
        let tables = self.tables.read();
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        Ok(tables
            .get_mut(&table)
            .and_then(|t| t.remove(key))
            .is_some())
    }

    async fn exists(&self, table: Table, key: &str) -> Result<bool> {
        let tables = self.tables.read();
        Ok(tables.get(&table).is_some_and(|t| t.contains_key(key)))
    }

    async fn counter_init(&self, key: &str, value: u64) -> Result<u64> {
        let mut counters = self.counters.lock();
        Ok(*counters.entry(key.to_string()).or_insert(value))
    }

    async fn counter_inc(&self, key: &str) -> Result<u64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let entries = tables.entry(table).or_default();

        if entries.get(key).map(|b| &b[..]) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn publish(&self, queue: QueueName, task: &Task) -> Result<()> {
        self.queues
            .lock()
            .entry(queue)
            .or_default()
            .push_back(task.clone());
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: QueueName, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a publish in between is not missed
            let notified = self.queue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self
                .queues
                .lock()
                .get_mut(&queue)
                .and_then(VecDeque::pop_front);
            if next.is_some() {
                return Ok(next);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, queue: QueueName) -> Result<usize> {
        Ok(self.queues.lock().get(&queue).map_or(0, VecDeque::len))
    }
}

#[async_trait]
impl CompletionBoard for MemoryStore {
    async fn signal(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        {
            let mut outcomes = self.outcomes.lock();
            let ttl = self.outcome_ttl;
            outcomes.retain(|_, (_, at)| at.elapsed() < ttl);
            outcomes.insert(task_id, (outcome, Instant::now()));
        }
        self.outcome_notify.notify_waiters();
        Ok(())
    }

    async fn wait(&self, task_id: TaskId, timeout: Duration) -> Result<Option<TaskOutcome>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.outcome_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((outcome, _)) = self.outcomes.lock().remove(&task_id) {
                return Ok(Some(outcome));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstio_core::{File, Location, TaskKind};
    use std::sync::Arc;

    fn make_task(id: u64) -> Task {
        Task::new(
            TaskKind::Write,
            TaskId(id),
            File::new(Location::Cache, format!("f#{}", id), 0, 16),
            File::new(Location::Buffers, "f", id * 16, 16),
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryStore::new();
        store
            .put(Table::Payload, "k", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(store.exists(Table::Payload, "k").await.unwrap());
        assert!(!store.exists(Table::Chunk, "k").await.unwrap());
        assert_eq!(
            store.get(Table::Payload, "k").await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );

        assert!(store.remove(Table::Payload, "k").await.unwrap());
        assert!(!store.remove(Table::Payload, "k").await.unwrap());
        assert!(store.get(Table::Payload, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.counter_inc("TASK_ID").await.unwrap(), 1);
        assert_eq!(store.counter_inc("TASK_ID").await.unwrap(), 2);
        assert_eq!(store.counter_init("TASK_ID", 100).await.unwrap(), 2);
        assert_eq!(store.counter_init("OTHER", 100).await.unwrap(), 100);
        assert_eq!(store.counter_inc("OTHER").await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();

        // Insert only if absent
        assert!(store
            .compare_and_swap(Table::FileChunk, "f", None, Some(Bytes::from_static(b"v1")))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap(Table::FileChunk, "f", None, Some(Bytes::from_static(b"v2")))
            .await
            .unwrap());

        // Replace with the right expectation only
        assert!(!store
            .compare_and_swap(Table::FileChunk, "f", Some(&b"zz"[..]), Some(Bytes::from_static(b"v2")))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(Table::FileChunk, "f", Some(&b"v1"[..]), Some(Bytes::from_static(b"v2")))
            .await
            .unwrap());

        // Delete
        assert!(store
            .compare_and_swap(Table::FileChunk, "f", Some(&b"v2"[..]), None)
            .await
            .unwrap());
        assert!(!store.exists(Table::FileChunk, "f").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_fifo_and_timeout() {
        let store = MemoryStore::new();
        let queue = QueueName::Worker(0);

        assert!(store
            .pop(queue, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        store.publish(queue, &make_task(1)).await.unwrap();
        store.publish(queue, &make_task(2)).await.unwrap();
        store.publish(QueueName::Worker(1), &make_task(3)).await.unwrap();
        assert_eq!(store.len(queue).await.unwrap(), 2);

        let first = store.pop(queue, Duration::from_millis(10)).await.unwrap().unwrap();
        let second = store.pop(queue, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task_id, TaskId(1));
        assert_eq!(second.task_id, TaskId(2));
        assert_eq!(store.len(QueueName::Worker(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_publish() {
        let store = Arc::new(MemoryStore::new());
        let queue = QueueName::Scheduler(0);

        let consumer = {
            let store = store.clone();
            tokio::spawn(async move { store.pop(queue, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.publish(queue, &make_task(42)).await.unwrap();

        let task = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(task.task_id, TaskId(42));
    }

    #[tokio::test]
    async fn test_completion_consumed_once() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait(TaskId(7), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.signal(TaskId(7), TaskOutcome::Done).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Some(TaskOutcome::Done));
        assert_eq!(store.pending_outcomes(), 0);

        // A second wait sees nothing
        let again = store.wait(TaskId(7), Duration::from_millis(10)).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_signal_before_wait() {
        let store = MemoryStore::new();
        store
            .signal(TaskId(3), TaskOutcome::Failed("short write".into()))
            .await
            .unwrap();
        let outcome = store.wait(TaskId(3), Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, Some(TaskOutcome::Failed("short write".into())));
    }

    #[tokio::test]
    async fn test_unclaimed_outcomes_expire() {
        let store = MemoryStore::with_outcome_ttl(Duration::from_millis(20));
        store.signal(TaskId(1), TaskOutcome::Done).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The next signal sweeps the stale marker
        store.signal(TaskId(2), TaskOutcome::Done).await.unwrap();
        assert_eq!(store.pending_outcomes(), 1);
        assert!(store
            .wait(TaskId(1), Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.wait(TaskId(2), Duration::from_millis(10)).await.unwrap(),
            Some(TaskOutcome::Done)
        );
    }
}
