//! I/O client backends
//!
//! Workers execute tasks through an [`IoClient`]. The backend is chosen
//! per task by its [`IoBackend`] tag through [`IoClients`].

use async_trait::async_trait;
use burstio_core::error::{BurstError, Result};
use burstio_core::IoBackend;
use bytes::{Bytes, BytesMut};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File operations a worker needs from a backend
#[async_trait]
pub trait IoClient: Send + Sync {
    /// Write all of `data` at `offset`, creating the file if missing
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()>;

    /// Read up to `size` bytes at `offset`; short at end of file
    async fn read(&self, path: &Path, offset: u64, size: u64) -> Result<Bytes>;

    /// Remove a file. False if it did not exist.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Copy `size` bytes from one file range to another
    async fn flush(&self, from: &Path, from_offset: u64, to: &Path, to_offset: u64, size: u64) -> Result<()> {
        let data = self.read(from, from_offset, size).await?;
        if (data.len() as u64) < size {
            return Err(BurstError::PartialIo {
                expected: size,
                actual: data.len() as u64,
            });
        }
        self.write(to, to_offset, &data).await
    }

    /// Copy a range into a new staged file, returning the bytes staged
    async fn stage(&self, from: &Path, offset: u64, size: u64, to: &Path) -> Result<u64> {
        let data = self.read(from, offset, size).await?;
        self.write(to, 0, &data).await?;
        Ok(data.len() as u64)
    }
}

/// Async file I/O on the tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixClient;

#[async_trait]
impl IoClient for PosixClient {
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written = 0;
        while written < data.len() {
            let n = file.write(&data[written..]).await?;
            if n == 0 {
                return Err(BurstError::PartialIo {
                    expected: data.len() as u64,
                    actual: written as u64,
                });
            }
            written += n;
        }
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::zeroed(size as usize);
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Buffered std::fs I/O on the blocking pool
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioClient;

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BurstError::Internal(format!("blocking I/O task: {}", e)))?
}

#[async_trait]
impl IoClient for StdioClient {
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let path = path.to_path_buf();
        let data = data.to_vec();
        blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            let mut out = std::io::BufWriter::new(file);
            out.seek(SeekFrom::Start(offset))?;
            match out.write_all(&data) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WriteZero => {
                    return Err(BurstError::PartialIo {
                        expected: data.len() as u64,
                        actual: 0,
                    });
                }
                Err(e) => return Err(e.into()),
            }
            out.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> Result<Bytes> {
        let path = path.to_path_buf();
        blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::with_capacity(size as usize);
            file.take(size).read_to_end(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        let path: PathBuf = path.to_path_buf();
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

/// One client per backend tag
#[derive(Debug, Default)]
pub struct IoClients {
    posix: PosixClient,
    stdio: StdioClient,
}

impl IoClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, backend: IoBackend) -> &dyn IoClient {
        match backend {
            IoBackend::Posix => &self.posix,
            IoBackend::Stdio => &self.stdio,
        }
    }
}
