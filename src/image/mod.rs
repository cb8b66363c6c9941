//! Content-addressed image model
//!
//! An [`Image`] is a manifest pointing at one config blob and an ordered
//! list of [`Layer`]s. An [`Index`] is a manifest pointing at other
//! manifests, typically one per platform. Both expose the exact bytes they
//! were built from; digests are always computed over those bytes.
//!
//! Implementations live in [`memory`] (built in process) and in
//! [`crate::remote`] (lazily fetched from a registry).

pub mod config;
pub mod manifest;
pub mod media_type;
pub mod memory;
pub mod validate;

pub use config::{ConfigFile, RootFs};
pub use manifest::{Descriptor, IndexManifest, Manifest, Platform};
pub use media_type::{MediaType, accepted_manifest_types};
pub use memory::{BytesLayer, MemoryImage, MemoryIndex};
pub use validate::{validate_image, validate_index};

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::reference::Repository;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A fresh byte stream owned by the caller for the duration of one read.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Layer: Send + Sync {
    /// sha256 of the compressed bytes, as referenced by the manifest.
    fn digest(&self) -> &Hash;

    /// sha256 of the uncompressed bytes, when known.
    fn diff_id(&self) -> Option<&Hash>;

    /// Length of the compressed stream.
    fn size(&self) -> u64;

    fn media_type(&self) -> &MediaType;

    async fn compressed(&self) -> Result<BlobReader>;

    async fn uncompressed(&self) -> Result<BlobReader>;

    /// Compressed stream starting at `offset`. Used to resume uploads.
    async fn compressed_from(&self, offset: u64) -> Result<BlobReader> {
        let mut reader = self.compressed().await?;
        let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
        if skipped != offset {
            return Err(RegistryError::Integrity(format!(
                "cannot resume {} at offset {}: stream ended after {} bytes",
                self.digest(),
                offset,
                skipped
            )));
        }
        Ok(reader)
    }

    /// Repository on the same registry the blob can be mounted from.
    fn mount_source(&self) -> Option<&Repository> {
        None
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type().clone(), self.size(), self.digest().clone())
    }
}

#[async_trait]
pub trait Image: Send + Sync {
    async fn media_type(&self) -> Result<MediaType>;

    /// The manifest exactly as stored.
    async fn raw_manifest(&self) -> Result<Bytes>;

    async fn raw_config(&self) -> Result<Bytes>;

    /// Layers in manifest order.
    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>>;

    async fn digest(&self) -> Result<Hash> {
        Ok(Hash::of(&self.raw_manifest().await?))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.raw_manifest().await?.len() as u64)
    }

    async fn manifest(&self) -> Result<Manifest> {
        Manifest::from_slice(&self.raw_manifest().await?)
    }

    async fn config_file(&self) -> Result<ConfigFile> {
        ConfigFile::from_slice(&self.raw_config().await?)
    }

    /// The config blob as a layer, so writers can treat it like any other blob.
    async fn config_layer(&self) -> Result<Arc<dyn Layer>> {
        let manifest = self.manifest().await?;
        let data = self.raw_config().await?;
        Ok(Arc::new(BytesLayer::raw(data, manifest.config.media_type)))
    }

    /// Layer or config blob with the given compressed digest.
    async fn layer_by_digest(&self, hash: &Hash) -> Result<Arc<dyn Layer>> {
        if self.manifest().await?.config.digest == *hash {
            return self.config_layer().await;
        }
        self.layers()
            .await?
            .into_iter()
            .find(|l| l.digest() == hash)
            .ok_or_else(|| RegistryError::NotFound(format!("layer {} not in image", hash)))
    }

    async fn layer_by_diff_id(&self, diff_id: &Hash) -> Result<Arc<dyn Layer>> {
        self.layers()
            .await?
            .into_iter()
            .find(|l| l.diff_id() == Some(diff_id))
            .ok_or_else(|| RegistryError::NotFound(format!("diff id {} not in image", diff_id)))
    }
}

#[async_trait]
pub trait Index: Send + Sync {
    async fn media_type(&self) -> Result<MediaType>;

    async fn raw_manifest(&self) -> Result<Bytes>;

    async fn image(&self, hash: &Hash) -> Result<Arc<dyn Image>>;

    async fn index(&self, hash: &Hash) -> Result<Arc<dyn Index>>;

    async fn digest(&self) -> Result<Hash> {
        Ok(Hash::of(&self.raw_manifest().await?))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.raw_manifest().await?.len() as u64)
    }

    async fn index_manifest(&self) -> Result<IndexManifest> {
        IndexManifest::from_slice(&self.raw_manifest().await?)
    }

    /// Resolve a child descriptor to an image or nested index.
    async fn child(&self, desc: &Descriptor) -> Result<Artifact> {
        if desc.media_type.is_index() {
            Ok(Artifact::Index(self.index(&desc.digest).await?))
        } else {
            Ok(Artifact::Image(self.image(&desc.digest).await?))
        }
    }

    /// First child image whose platform satisfies `wanted`.
    async fn image_for_platform(&self, wanted: &Platform) -> Result<Arc<dyn Image>> {
        let index = self.index_manifest().await?;
        let desc = index.find_platform(wanted).ok_or_else(|| {
            RegistryError::NotFound(format!("no child with platform {} in index", wanted))
        })?;
        self.image(&desc.digest).await
    }
}

/// Either kind of top-level manifest.
#[derive(Clone)]
pub enum Artifact {
    Image(Arc<dyn Image>),
    Index(Arc<dyn Index>),
}

impl Artifact {
    pub async fn media_type(&self) -> Result<MediaType> {
        match self {
            Artifact::Image(img) => img.media_type().await,
            Artifact::Index(idx) => idx.media_type().await,
        }
    }

    pub async fn raw_manifest(&self) -> Result<Bytes> {
        match self {
            Artifact::Image(img) => img.raw_manifest().await,
            Artifact::Index(idx) => idx.raw_manifest().await,
        }
    }

    pub async fn digest(&self) -> Result<Hash> {
        match self {
            Artifact::Image(img) => img.digest().await,
            Artifact::Index(idx) => idx.digest().await,
        }
    }

    /// Descriptor suitable for a parent index.
    pub async fn descriptor(&self) -> Result<Descriptor> {
        let raw = self.raw_manifest().await?;
        Ok(Descriptor::new(
            self.media_type().await?,
            raw.len() as u64,
            Hash::of(&raw),
        ))
    }
}

impl From<Arc<dyn Image>> for Artifact {
    fn from(image: Arc<dyn Image>) -> Self {
        Artifact::Image(image)
    }
}

impl From<Arc<dyn Index>> for Artifact {
    fn from(index: Arc<dyn Index>) -> Self {
        Artifact::Index(index)
    }
}
