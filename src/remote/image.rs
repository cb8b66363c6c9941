//! Lazily fetched images and layers

use crate::error::{RegistryError, Result};
use crate::hash::{Hash, VerifyingReader};
use crate::image::{
    BlobReader, ConfigFile, Descriptor, Image, IndexManifest, Layer, Manifest, MediaType, Platform,
};
use crate::reference::{Reference, Repository};
use crate::remote::fetcher::Fetcher;
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::OnceCell;
use tracing::debug;

/// Upper bound on the buffer reserved up front for a config blob; the
/// advertised size comes from the registry.
const MAX_CONFIG_PREALLOC: u64 = 1 << 20;

/// Platform picked from an index when the caller did not ask for one.
pub fn default_platform() -> Platform {
    Platform::new("linux", "amd64")
}

struct Fetched {
    raw: Bytes,
    descriptor: Descriptor,
    manifest: Manifest,
}

impl Fetched {
    fn new(raw: Bytes, descriptor: Descriptor) -> Result<Self> {
        if !descriptor.media_type.is_image() {
            return Err(RegistryError::UnexpectedMediaType(format!(
                "{} is not an image manifest",
                descriptor.media_type
            )));
        }
        let manifest = Manifest::from_slice(&raw)?;
        Ok(Fetched {
            raw,
            descriptor,
            manifest,
        })
    }
}

/// An image whose manifest, config and layers are fetched on first use.
///
/// When the reference resolves to an index, the child matching the
/// configured platform is fetched instead.
pub struct RemoteImage {
    fetcher: Arc<Fetcher>,
    reference: Reference,
    platform: Platform,
    manifest: OnceCell<Fetched>,
    config: OnceCell<Bytes>,
}

impl RemoteImage {
    pub fn new(fetcher: Arc<Fetcher>, reference: Reference, platform: Option<Platform>) -> Self {
        RemoteImage {
            fetcher,
            reference,
            platform: platform.unwrap_or_else(default_platform),
            manifest: OnceCell::new(),
            config: OnceCell::new(),
        }
    }

    /// Wrap manifest bytes that were already fetched and verified.
    pub fn from_manifest(
        fetcher: Arc<Fetcher>,
        reference: Reference,
        raw: Bytes,
        descriptor: Descriptor,
    ) -> Result<Self> {
        let fetched = Fetched::new(raw, descriptor)?;
        Ok(RemoteImage {
            fetcher,
            reference,
            platform: default_platform(),
            manifest: OnceCell::new_with(Some(fetched)),
            config: OnceCell::new(),
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn repository(&self) -> &Repository {
        self.fetcher.repository()
    }

    /// Descriptor of the image manifest (the platform child when the
    /// reference named an index).
    pub async fn descriptor(&self) -> Result<Descriptor> {
        Ok(self.fetched().await?.descriptor.clone())
    }

    async fn fetched(&self) -> Result<&Fetched> {
        self.manifest.get_or_try_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Result<Fetched> {
        let (raw, descriptor) = self.fetcher.fetch_manifest(&self.reference).await?;
        if !descriptor.media_type.is_index() {
            return Fetched::new(raw, descriptor);
        }

        let index = IndexManifest::from_slice(&raw)?;
        let child = index.find_platform(&self.platform).ok_or_else(|| {
            RegistryError::NotFound(format!(
                "no child with platform {} in index {}",
                self.platform, self.reference
            ))
        })?;
        debug!(reference = %self.reference, platform = %self.platform, child = %child.digest, "resolved index child");

        let child_ref = Reference::from(self.repository().digest(child.digest.clone()));
        let (raw, descriptor) = self.fetcher.fetch_manifest(&child_ref).await?;
        Fetched::new(raw, descriptor)
    }
}

#[async_trait]
impl Image for RemoteImage {
    async fn media_type(&self) -> Result<MediaType> {
        Ok(self.fetched().await?.descriptor.media_type.clone())
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.fetched().await?.raw.clone())
    }

    async fn raw_config(&self) -> Result<Bytes> {
        let config = self
            .config
            .get_or_try_init(|| async {
                let desc = &self.fetched().await?.manifest.config;
                let mut reader = self
                    .fetcher
                    .fetch_blob_as(&desc.digest, Some(desc.size), Some(&desc.media_type))
                    .await?;
                let mut data = Vec::with_capacity(desc.size.min(MAX_CONFIG_PREALLOC) as usize);
                reader.read_to_end(&mut data).await?;
                Ok::<_, RegistryError>(Bytes::from(data))
            })
            .await?;
        Ok(config.clone())
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        let manifest = &self.fetched().await?.manifest;
        let config = ConfigFile::from_slice(&self.raw_config().await?)?;
        let diff_ids = config.diff_ids();
        if diff_ids.len() != manifest.layers.len() {
            return Err(RegistryError::Integrity(format!(
                "{} lists {} layers but its config has {} diff_ids",
                self.reference,
                manifest.layers.len(),
                diff_ids.len()
            )));
        }
        Ok(manifest
            .layers
            .iter()
            .zip(diff_ids)
            .map(|(desc, diff_id)| {
                Arc::new(RemoteLayer::new(
                    self.fetcher.clone(),
                    desc.clone(),
                    Some(diff_id.clone()),
                )) as Arc<dyn Layer>
            })
            .collect())
    }

    async fn digest(&self) -> Result<Hash> {
        Ok(self.fetched().await?.descriptor.digest.clone())
    }

    async fn manifest(&self) -> Result<Manifest> {
        Ok(self.fetched().await?.manifest.clone())
    }
}

/// A blob in a remote repository, fetched on every read.
pub struct RemoteLayer {
    fetcher: Arc<Fetcher>,
    descriptor: Descriptor,
    diff_id: Option<Hash>,
}

impl RemoteLayer {
    pub fn new(fetcher: Arc<Fetcher>, descriptor: Descriptor, diff_id: Option<Hash>) -> Self {
        RemoteLayer {
            fetcher,
            descriptor,
            diff_id,
        }
    }
}

#[async_trait]
impl Layer for RemoteLayer {
    fn digest(&self) -> &Hash {
        &self.descriptor.digest
    }

    fn diff_id(&self) -> Option<&Hash> {
        self.diff_id.as_ref()
    }

    fn size(&self) -> u64 {
        self.descriptor.size
    }

    fn media_type(&self) -> &MediaType {
        &self.descriptor.media_type
    }

    async fn compressed(&self) -> Result<BlobReader> {
        self.fetcher
            .fetch_blob(&self.descriptor.digest, Some(self.descriptor.size))
            .await
    }

    async fn uncompressed(&self) -> Result<BlobReader> {
        let media_type = &self.descriptor.media_type;
        if *media_type == MediaType::OciZstdLayer {
            return Err(RegistryError::UnexpectedMediaType(format!(
                "cannot decompress {}",
                media_type
            )));
        }
        let compressed = self.compressed().await?;
        if !media_type.is_gzip() {
            return Ok(compressed);
        }
        let decoded = GzipDecoder::new(BufReader::new(compressed));
        Ok(match &self.diff_id {
            Some(diff_id) => Box::new(VerifyingReader::new(decoded, diff_id.clone(), None)),
            None => Box::new(decoded),
        })
    }

    fn mount_source(&self) -> Option<&Repository> {
        Some(self.fetcher.repository())
    }

    fn descriptor(&self) -> Descriptor {
        self.descriptor.clone()
    }
}
