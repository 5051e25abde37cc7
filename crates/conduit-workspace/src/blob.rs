//! Blob store backends.

use crate::compression::{CompressionType, compress, decompress};
use crate::keys::sanitize_key;
use async_trait::async_trait;
use conduit_core::ports::BlobStore;
use conduit_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// In-process blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}

/// Filesystem-backed blob store for local runs.
pub struct FilesystemBlobStore {
    root_dir: PathBuf,
    compression: CompressionType,
}

impl FilesystemBlobStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            compression: CompressionType::Zstd,
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(sanitize_key(key))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create blob dir: {}", e)))?;
        let encoded = compress(&data, self.compression)?;
        tokio::fs::write(self.key_path(key), encoded)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write blob {}: {}", key, e)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(encoded) => Ok(Some(decompress(&encoded, self.compression)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read blob {}: {}", key, e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        tokio::fs::try_exists(self.key_path(key))
            .await
            .map_err(|e| Error::Storage(format!("Failed to stat blob {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete blob {}: {}", key, e))),
        }
    }
}
