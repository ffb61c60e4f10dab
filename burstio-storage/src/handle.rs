//! Store handle passed to every component
//!
//! Bundles the three store capabilities behind trait objects. Handles are
//! cheap to clone and are injected through constructors.

use crate::backend::{CompletionBoard, KvStore, TaskQueue};
use crate::memory::MemoryStore;
use crate::redis_backend::RedisStore;
use crate::sled_backend::SledStore;
use burstio_core::error::Result;
use burstio_core::{StoreBackend, StoreSettings, TaskId};
use std::sync::Arc;
use tracing::info;

/// Counter used to allocate task ids
pub const TASK_ID_COUNTER: &str = "TASK_ID";

/// Counter used to allocate chunk dataspace ids
pub const DATASPACE_COUNTER: &str = "DATASPACE_ID";

/// Shared store capabilities
#[derive(Clone)]
pub struct StoreHandle {
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub completions: Arc<dyn CompletionBoard>,
}

impl StoreHandle {
    /// Handle over a single in-memory store
    pub fn memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    /// Handle over an existing in-memory store
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            kv: store.clone(),
            queue: store.clone(),
            completions: store,
        }
    }

    /// Connect to the backend named in the settings.
    ///
    /// Sled only persists tables; its queues and completions stay in process.
    pub async fn connect(settings: &StoreSettings) -> Result<Self> {
        let handle = match settings.backend {
            StoreBackend::Memory => Self::memory(),
            StoreBackend::Sled => {
                let local = Arc::new(MemoryStore::new());
                Self {
                    kv: Arc::new(SledStore::open(&settings.path)?),
                    queue: local.clone(),
                    completions: local,
                }
            }
            StoreBackend::Redis => {
                let store = Arc::new(RedisStore::connect(&settings.url, settings.prefix.clone()).await?);
                Self {
                    kv: store.clone(),
                    queue: store.clone(),
                    completions: store,
                }
            }
        };

        info!(backend = ?settings.backend, "Store handle ready");
        Ok(handle)
    }

    /// Allocate a task id unique within this store
    pub async fn next_task_id(&self) -> Result<TaskId> {
        Ok(TaskId(self.kv.counter_inc(TASK_ID_COUNTER).await?))
    }

    /// Allocate a chunk dataspace id
    pub async fn next_dataspace_id(&self) -> Result<u64> {
        self.kv.counter_inc(DATASPACE_COUNTER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{QueueName, Table};
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_ids_unique() {
        let handle = StoreHandle::memory();
        let a = handle.next_task_id().await.unwrap();
        let b = handle.next_task_id().await.unwrap();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(handle.next_dataspace_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_sled() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = StoreSettings {
            backend: StoreBackend::Sled,
            path: dir.path().join("meta"),
            ..Default::default()
        };
        let handle = StoreHandle::connect(&settings).await.unwrap();
        handle
            .kv
            .put(Table::FileStat, "f", bytes::Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(handle.kv.exists(Table::FileStat, "f").await.unwrap());
        assert_eq!(handle.queue.len(QueueName::Scheduler(0)).await.unwrap(), 0);
        assert!(handle
            .completions
            .wait(TaskId(1), Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());
    }
}
