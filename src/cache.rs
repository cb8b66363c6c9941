//! Content-addressed blob caches
//!
//! A cache is consulted before a blob or digest-addressed manifest is
//! fetched and populated after a miss. Entries are keyed by sha256, so a
//! cached entry can never go stale. Misses are not remembered.
//!
//! Layout of [`FilesystemCache`]:
//! ```text
//! <root>/
//!   blobs/sha256/<hex>
//! ```

use crate::error::{RegistryError, Result};
use crate::hash::{Hash, HashingReader};
use crate::image::BlobReader;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

pub const BLOBS_DIR: &str = "blobs";
pub const SHA256_PREFIX: &str = "sha256";

#[async_trait]
pub trait BlobCache: Send + Sync {
    /// A fresh stream over the cached blob, or `None` on a miss.
    async fn load(&self, hash: &Hash) -> Result<Option<BlobReader>>;

    /// Consume `reader`, remember its bytes under `hash` and return a fresh
    /// stream over the same bytes.
    async fn store(&self, hash: &Hash, reader: BlobReader) -> Result<BlobReader>;
}

/// Blobs stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    root: PathBuf,
}

impl FilesystemCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FilesystemCache {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.root.join(BLOBS_DIR).join(SHA256_PREFIX).join(hash.hex())
    }
}

#[async_trait]
impl BlobCache for FilesystemCache {
    async fn load(&self, hash: &Hash) -> Result<Option<BlobReader>> {
        match fs::File::open(self.blob_path(hash)).await {
            Ok(file) => {
                debug!(blob = %hash, "cache hit");
                Ok(Some(Box::new(file)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, hash: &Hash, reader: BlobReader) -> Result<BlobReader> {
        let path = self.blob_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Concurrent stores of one blob each write their own temp file; the
        // rename makes whichever finishes last visible.
        let temp_path = path.with_extension(format!("tmp-{}", rand::random::<u32>()));
        let mut file = fs::File::create(&temp_path).await?;
        let mut hashing = HashingReader::new(reader);
        let copied = tokio::io::copy(&mut hashing, &mut file).await;
        drop(file);
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let (got, size) = hashing.finish();
        if &got != hash {
            let _ = fs::remove_file(&temp_path).await;
            return Err(RegistryError::Integrity(format!(
                "refusing to cache {} bytes under {}: content hashes to {}",
                size, hash, got
            )));
        }
        fs::rename(&temp_path, &path).await?;
        debug!(blob = %hash, size, "cached");

        Ok(Box::new(fs::File::open(&path).await?))
    }
}

/// Blobs held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    blobs: Arc<RwLock<HashMap<Hash, Bytes>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blobs.read().is_ok_and(|b| b.contains_key(hash))
    }
}

#[async_trait]
impl BlobCache for MemoryCache {
    async fn load(&self, hash: &Hash) -> Result<Option<BlobReader>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| RegistryError::Config("memory cache lock poisoned".to_string()))?;
        Ok(blobs
            .get(hash)
            .map(|data| Box::new(Cursor::new(data.clone())) as BlobReader))
    }

    async fn store(&self, hash: &Hash, mut reader: BlobReader) -> Result<BlobReader> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let data = Bytes::from(data);
        if Hash::of(&data) != *hash {
            warn!(blob = %hash, "not caching blob whose content does not match its digest");
        } else if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(hash.clone(), data.clone());
        }
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Serve hits from an inner cache and silently drop writes.
#[derive(Debug, Clone)]
pub struct ReadOnly<C> {
    inner: C,
}

impl<C: BlobCache> ReadOnly<C> {
    pub fn new(inner: C) -> Self {
        ReadOnly { inner }
    }
}

#[async_trait]
impl<C: BlobCache> BlobCache for ReadOnly<C> {
    async fn load(&self, hash: &Hash) -> Result<Option<BlobReader>> {
        self.inner.load(hash).await
    }

    async fn store(&self, _hash: &Hash, reader: BlobReader) -> Result<BlobReader> {
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    fn blob(data: &'static [u8]) -> BlobReader {
        Box::new(Cursor::new(data))
    }

    #[tokio::test]
    async fn test_filesystem_store_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path());
        let hash = Hash::of(b"layer bytes");

        assert!(cache.load(&hash).await.unwrap().is_none());
        let stored = cache.store(&hash, blob(b"layer bytes")).await.unwrap();
        assert_eq!(read_all(stored).await, b"layer bytes");

        let loaded = cache.load(&hash).await.unwrap().unwrap();
        assert_eq!(read_all(loaded).await, b"layer bytes");
        assert!(dir.path().join("blobs/sha256").join(hash.hex()).exists());
    }

    #[tokio::test]
    async fn test_filesystem_rejects_wrong_content() {
        let dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(dir.path());
        let hash = Hash::of(b"expected");

        let err = cache.store(&hash, blob(b"something else")).await.err().unwrap();
        assert!(matches!(err, RegistryError::Integrity(_)));
        assert!(cache.load(&hash).await.unwrap().is_none());
        let leftovers = std::fs::read_dir(dir.path().join("blobs/sha256")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryCache::new();
        let hash = Hash::of(b"config");
        let stored = cache.store(&hash, blob(b"config")).await.unwrap();
        assert_eq!(read_all(stored).await, b"config");
        assert!(cache.contains(&hash));
        assert_eq!(read_all(cache.load(&hash).await.unwrap().unwrap()).await, b"config");
    }

    #[tokio::test]
    async fn test_read_only_drops_writes() {
        let inner = MemoryCache::new();
        let cache = ReadOnly::new(inner.clone());
        let hash = Hash::of(b"data");
        let passed = cache.store(&hash, blob(b"data")).await.unwrap();
        assert_eq!(read_all(passed).await, b"data");
        assert!(inner.is_empty());

        inner.store(&hash, blob(b"data")).await.unwrap();
        assert!(cache.load(&hash).await.unwrap().is_some());
    }
}
