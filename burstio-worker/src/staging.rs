//! Worker staging directory
//!
//! Chunks placed in `Buffers` live as one flat file per chunk key under
//! the worker's staging directory. Used capacity is the total size of
//! those files.

use burstio_core::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One worker's staging directory
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    /// Create the directory if needed and empty it.
    ///
    /// Anything left over from a previous run is no longer referenced by
    /// the chunk rings of a fresh deployment.
    pub async fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            removed += 1;
        }

        info!(root = %root.display(), removed, "Staging directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged file holding a chunk key
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('/', "_"))
    }

    /// Bytes currently staged
    pub async fn used_bytes(&self) -> Result<u64> {
        let mut used = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => used += meta.len(),
                Ok(_) => {}
                // Deleted between listing and stat
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(root = %self.root.display(), used, "Measured staging usage");
        Ok(used)
    }
}
