//! Sled-based key/value store
//!
//! Persistent `KvStore` for single-host deployments. Each table is its own
//! sled tree; counters are big-endian `u64` values updated in place.
//! Sled is pure Rust and its native compare-and-swap backs the chunk ring.

use crate::backend::{KvStore, Table};
use async_trait::async_trait;
use burstio_core::error::{BurstError, Result};
use bytes::Bytes;
use std::path::Path;
use tracing::{debug, info};

/// Sled-based store
pub struct SledStore {
    db: sled::Db,
}

fn storage_err(e: sled::Error) -> BurstError {
    BurstError::Store(e.to_string())
}

fn counter_value(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes).map_or(0, u64::from_be_bytes)
}

impl SledStore {
    /// Open or create a store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled store");

        let db = sled::open(path.as_ref())
            .map_err(|e| BurstError::Store(format!("Failed to open Sled: {}", e)))?;

        Ok(Self { db })
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| BurstError::Store(format!("Failed to open Sled: {}", e)))?;
        Ok(Self { db })
    }

    /// Get the tree backing a table
    fn tree(&self, table: Table) -> Result<sled::Tree> {
        self.db.open_tree(table.as_str()).map_err(storage_err)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.map_err(storage_err)?;
        Ok(())
    }

    /// Number of keys in a table
    pub fn table_len(&self, table: Table) -> Result<usize> {
        Ok(self.tree(table)?.len())
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn put(&self, table: Table, key: &str, value: Bytes) -> Result<()> {
        self.tree(table)?
            .insert(key.as_bytes(), &value[..])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Bytes>> {
        let value = self.tree(table)?.get(key.as_bytes()).map_err(storage_err)?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    async fn remove(&self, table: Table, key: &str) -> Result<bool> {
        let removed = self
            .tree(table)?
            .remove(key.as_bytes())
            .map_err(storage_err)?;
        Ok(removed.is_some())
    }

    async fn exists(&self, table: Table, key: &str) -> Result<bool> {
        self.tree(table)?
            .contains_key(key.as_bytes())
            .map_err(storage_err)
    }

    async fn counter_init(&self, key: &str, value: u64) -> Result<u64> {
        let tree = self.tree(Table::Counter)?;
        let initial = value.to_be_bytes().to_vec();
        match tree
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(initial))
            .map_err(storage_err)?
        {
            Ok(()) => Ok(value),
            Err(existing) => Ok(existing.current.as_deref().map_or(0, counter_value)),
        }
    }

    async fn counter_inc(&self, key: &str) -> Result<u64> {
        let tree = self.tree(Table::Counter)?;
        let updated = tree
            .update_and_fetch(key.as_bytes(), |old| {
                let next = old.map_or(0, counter_value) + 1;
                Some(next.to_be_bytes().to_vec())
            })
            .map_err(storage_err)?;

        let value = updated.as_deref().map_or(0, counter_value);
        debug!(key, value, "Counter incremented");
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> Result<bool> {
        let swapped = self
            .tree(table)?
            .compare_and_swap(key.as_bytes(), expected, new.map(|b| b.to_vec()))
            .map_err(storage_err)?;
        Ok(swapped.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = SledStore::open_temporary().unwrap();

        store
            .put(Table::FileStat, "f", Bytes::from_static(b"stat"))
            .await
            .unwrap();
        assert!(store.exists(Table::FileStat, "f").await.unwrap());
        assert!(!store.exists(Table::FileChunk, "f").await.unwrap());
        assert_eq!(
            store.get(Table::FileStat, "f").await.unwrap().unwrap(),
            Bytes::from_static(b"stat")
        );
        assert!(store.remove(Table::FileStat, "f").await.unwrap());
        assert!(store.get(Table::FileStat, "f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = SledStore::open_temporary().unwrap();
        assert_eq!(store.counter_init("DATASPACE_ID", 10).await.unwrap(), 10);
        assert_eq!(store.counter_init("DATASPACE_ID", 50).await.unwrap(), 10);
        assert_eq!(store.counter_inc("DATASPACE_ID").await.unwrap(), 11);
        assert_eq!(store.counter_inc("TASK_ID").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = SledStore::open_temporary().unwrap();
        assert!(store
            .compare_and_swap(Table::FileChunk, "f", None, Some(Bytes::from_static(b"a")))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap(Table::FileChunk, "f", Some(&b"b"[..]), Some(Bytes::from_static(b"c")))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(Table::FileChunk, "f", Some(&b"a"[..]), None)
            .await
            .unwrap());
        assert_eq!(store.table_len(Table::FileChunk).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store
                .put(Table::Chunk, "f#1", Bytes::from_static(b"meta"))
                .await
                .unwrap();
            store.counter_inc("TASK_ID").await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert!(store.exists(Table::Chunk, "f#1").await.unwrap());
        assert_eq!(store.counter_inc("TASK_ID").await.unwrap(), 2);
    }
}
