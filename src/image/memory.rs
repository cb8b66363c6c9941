//! Images, indexes and layers built in process

use crate::error::{RegistryError, Result};
use crate::hash::{Hash, canonical};
use crate::image::{
    Artifact, BlobReader, ConfigFile, Descriptor, Image, Index, IndexManifest, Layer, Manifest,
    MediaType, Platform,
};
use crate::reference::Repository;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;

/// A blob held entirely in memory.
#[derive(Debug, Clone)]
pub struct BytesLayer {
    compressed: Bytes,
    uncompressed: Option<Bytes>,
    digest: Hash,
    diff_id: Hash,
    media_type: MediaType,
    mount_source: Option<Repository>,
}

impl BytesLayer {
    /// Gzip an uncompressed layer (usually a tar stream).
    pub fn gzip(uncompressed: impl Into<Bytes>) -> Result<Self> {
        let uncompressed = uncompressed.into();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&uncompressed)?;
        let compressed = Bytes::from(encoder.finish()?);
        Ok(BytesLayer {
            digest: Hash::of(&compressed),
            diff_id: Hash::of(&uncompressed),
            compressed,
            uncompressed: Some(uncompressed),
            media_type: MediaType::OciLayer,
            mount_source: None,
        })
    }

    /// A blob stored as is, e.g. a config or an uncompressed layer.
    pub fn raw(data: impl Into<Bytes>, media_type: MediaType) -> Self {
        let data = data.into();
        let digest = Hash::of(&data);
        BytesLayer {
            diff_id: digest.clone(),
            digest,
            compressed: data,
            uncompressed: None,
            media_type,
            mount_source: None,
        }
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_mount_source(mut self, repository: Repository) -> Self {
        self.mount_source = Some(repository);
        self
    }

    pub fn bytes(&self) -> &Bytes {
        &self.compressed
    }
}

#[async_trait]
impl Layer for BytesLayer {
    fn digest(&self) -> &Hash {
        &self.digest
    }

    fn diff_id(&self) -> Option<&Hash> {
        Some(&self.diff_id)
    }

    fn size(&self) -> u64 {
        self.compressed.len() as u64
    }

    fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    async fn compressed(&self) -> Result<BlobReader> {
        Ok(Box::new(Cursor::new(self.compressed.clone())))
    }

    async fn uncompressed(&self) -> Result<BlobReader> {
        let data = self.uncompressed.as_ref().unwrap_or(&self.compressed);
        Ok(Box::new(Cursor::new(data.clone())))
    }

    async fn compressed_from(&self, offset: u64) -> Result<BlobReader> {
        if offset > self.size() {
            return Err(RegistryError::Integrity(format!(
                "offset {} beyond end of {} byte blob",
                offset,
                self.size()
            )));
        }
        Ok(Box::new(Cursor::new(self.compressed.slice(offset as usize..))))
    }

    fn mount_source(&self) -> Option<&Repository> {
        self.mount_source.as_ref()
    }
}

/// An image whose manifest, config and layers are all in memory.
#[derive(Clone)]
pub struct MemoryImage {
    media_type: MediaType,
    raw_manifest: Bytes,
    raw_config: Bytes,
    layers: Vec<Arc<dyn Layer>>,
}

impl MemoryImage {
    /// Build an image of the given manifest type. The config's diff ids are
    /// replaced by those of `layers`.
    pub fn new(
        media_type: MediaType,
        mut config: ConfigFile,
        layers: Vec<Arc<dyn Layer>>,
    ) -> Result<Self> {
        config.rootfs.diff_ids = layers
            .iter()
            .map(|l| {
                l.diff_id().cloned().ok_or_else(|| {
                    RegistryError::Integrity(format!("layer {} has no diff id", l.digest()))
                })
            })
            .collect::<Result<_>>()?;
        let raw_config = canonical::to_vec(&config)?;
        let config_desc = Descriptor::for_bytes(media_type.config_type(), &raw_config);
        let manifest = Manifest::new(
            media_type.clone(),
            config_desc,
            layers.iter().map(|l| l.descriptor()).collect(),
        );
        Ok(MemoryImage {
            media_type,
            raw_manifest: canonical::to_vec(&manifest)?.into(),
            raw_config: raw_config.into(),
            layers,
        })
    }

    /// Wrap manifest and config bytes exactly as given.
    pub fn from_raw(
        raw_manifest: impl Into<Bytes>,
        raw_config: impl Into<Bytes>,
        layers: Vec<Arc<dyn Layer>>,
    ) -> Result<Self> {
        let raw_manifest = raw_manifest.into();
        let manifest = Manifest::from_slice(&raw_manifest)?;
        Ok(MemoryImage {
            media_type: manifest.media_type(),
            raw_manifest,
            raw_config: raw_config.into(),
            layers,
        })
    }
}

#[async_trait]
impl Image for MemoryImage {
    async fn media_type(&self) -> Result<MediaType> {
        Ok(self.media_type.clone())
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw_manifest.clone())
    }

    async fn raw_config(&self) -> Result<Bytes> {
        Ok(self.raw_config.clone())
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        Ok(self.layers.clone())
    }
}

/// An index over in-memory (or any other) children.
#[derive(Clone)]
pub struct MemoryIndex {
    media_type: MediaType,
    raw_manifest: Bytes,
    children: HashMap<Hash, Artifact>,
}

impl MemoryIndex {
    pub async fn new(
        media_type: MediaType,
        children: Vec<(Artifact, Option<Platform>)>,
    ) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(children.len());
        let mut by_digest = HashMap::with_capacity(children.len());
        for (child, platform) in children {
            let mut desc = child.descriptor().await?;
            desc.platform = platform;
            by_digest.insert(desc.digest.clone(), child);
            descriptors.push(desc);
        }
        let manifest = IndexManifest::new(media_type.clone(), descriptors);
        Ok(MemoryIndex {
            media_type,
            raw_manifest: canonical::to_vec(&manifest)?.into(),
            children: by_digest,
        })
    }

    fn child_of(&self, hash: &Hash) -> Result<&Artifact> {
        self.children
            .get(hash)
            .ok_or_else(|| RegistryError::NotFound(format!("child {} not in index", hash)))
    }
}

#[async_trait]
impl Index for MemoryIndex {
    async fn media_type(&self) -> Result<MediaType> {
        Ok(self.media_type.clone())
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw_manifest.clone())
    }

    async fn image(&self, hash: &Hash) -> Result<Arc<dyn Image>> {
        match self.child_of(hash)? {
            Artifact::Image(img) => Ok(img.clone()),
            Artifact::Index(_) => Err(RegistryError::UnexpectedMediaType(format!(
                "child {} is an index, not an image",
                hash
            ))),
        }
    }

    async fn index(&self, hash: &Hash) -> Result<Arc<dyn Index>> {
        match self.child_of(hash)? {
            Artifact::Index(idx) => Ok(idx.clone()),
            Artifact::Image(_) => Err(RegistryError::UnexpectedMediaType(format!(
                "child {} is an image, not an index",
                hash
            ))),
        }
    }
}
