//! Redis store
//!
//! Networked implementation of every store capability, shared by the
//! client, scheduler and worker processes of one deployment.
//!
//! Layout under the configured prefix:
//! - `{prefix}:{table}:{key}` plain values
//! - `{prefix}:counter:{key}` integer counters (`INCR`)
//! - `{prefix}:queue:{queue}` task lists (`RPUSH` / `BLPOP`)
//! - `{prefix}:write_finished:{task_id}` one-element outcome lists

use crate::backend::{
    decode, encode, CompletionBoard, KvStore, QueueName, Table, TaskOutcome, TaskQueue,
    OUTCOME_TTL,
};
use async_trait::async_trait;
use burstio_core::error::{BurstError, Result};
use burstio_core::{Task, TaskId};
use bytes::Bytes;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::{debug, info};

/// Server-side compare-and-swap.
/// ARGV: expect_absent, expected, has_new, new
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
else
  if (not current) or current ~= ARGV[2] then return 0 end
end
if ARGV[3] == '1' then
  redis.call('SET', KEYS[1], ARGV[4])
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Smallest BLPOP timeout; zero would block forever
const MIN_BLOCK_SECS: f64 = 0.01;

fn redis_err(e: redis::RedisError) -> BurstError {
    BurstError::Store(format!("Redis: {}", e))
}

/// Redis store client
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    /// Connections reserved for blocking pops, which would stall `conn`
    blocking: Mutex<Vec<MultiplexedConnection>>,
    prefix: String,
    cas: Script,
}

impl RedisStore {
    /// Connect to a Redis server
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(redis_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_err)?;
        info!(url, "Connected to Redis store");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            prefix: prefix.into(),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    /// Build a key with prefix
    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    fn table_key(&self, table: Table, key: &str) -> String {
        self.key(&[table.as_str(), key])
    }

    fn queue_key(&self, queue: QueueName) -> String {
        self.key(&["queue", &queue.to_string()])
    }

    fn outcome_key(&self, task_id: TaskId) -> String {
        self.key(&[Table::WriteFinished.as_str(), &task_id.to_string()])
    }

    async fn take_blocking(&self) -> Result<MultiplexedConnection> {
        let pooled = self.blocking.lock().pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(redis_err),
        }
    }

    fn return_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().push(conn);
    }

    /// `BLPOP` on a dedicated connection
    async fn blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut conn = self.take_blocking().await?;
        let secs = timeout.as_secs_f64().max(MIN_BLOCK_SECS);
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.return_blocking(conn);
        Ok(popped.map(|(_, value)| value))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn put(&self, table: Table, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.table_key(table, key), &value[..])
            .await
            .map_err(redis_err)
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(self.table_key(table, key))
            .await
            .map_err(redis_err)?;
        Ok(value.map(Bytes::from))
    }

    async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn
            .del(self.table_key(table, key))
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, table: Table, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.table_key(table, key))
            .await
            .map_err(redis_err)
    }

    async fn counter_init(&self, key: &str, value: u64) -> Result<u64> {
        let key = self.table_key(Table::Counter, key);
        let mut conn = self.conn.clone();
        let _: bool = conn.set_nx(&key, value).await.map_err(redis_err)?;
        let current: Option<u64> = conn.get(&key).await.map_err(redis_err)?;
        Ok(current.unwrap_or(value))
    }

    async fn counter_inc(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.incr(self.table_key(Table::Counter, key), 1u64)
            .await
            .map_err(redis_err)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(self.table_key(table, key))
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.as_deref().unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(swapped == 1)
    }
}

#[async_trait]
impl TaskQueue for RedisStore {
    async fn publish(&self, queue: QueueName, task: &Task) -> Result<()> {
        let payload = encode(task)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.queue_key(queue), &payload[..])
            .await
            .map_err(redis_err)?;
        debug!(%queue, task_id = %task.task_id, "Task published");
        Ok(())
    }

    async fn pop(&self, queue: QueueName, timeout: Duration) -> Result<Option<Task>> {
        match self.blocking_pop(&self.queue_key(queue), timeout).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn len(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(self.queue_key(queue)).await.map_err(redis_err)
    }
}

#[async_trait]
impl CompletionBoard for RedisStore {
    async fn signal(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let key = self.outcome_key(task_id);
        let payload = encode(&outcome)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .rpush(&key, &payload[..])
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(OUTCOME_TTL.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn wait(&self, task_id: TaskId, timeout: Duration) -> Result<Option<TaskOutcome>> {
        match self.blocking_pop(&self.outcome_key(task_id), timeout).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
