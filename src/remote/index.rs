//! Lazily fetched indexes

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::{Descriptor, Image, Index, MediaType};
use crate::reference::{Reference, Repository};
use crate::remote::fetcher::Fetcher;
use crate::remote::image::RemoteImage;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A manifest list or OCI index. Children are only fetched when asked for.
pub struct RemoteIndex {
    fetcher: Arc<Fetcher>,
    reference: Reference,
    manifest: OnceCell<(Bytes, Descriptor)>,
}

impl RemoteIndex {
    pub fn new(fetcher: Arc<Fetcher>, reference: Reference) -> Self {
        RemoteIndex {
            fetcher,
            reference,
            manifest: OnceCell::new(),
        }
    }

    /// Wrap index bytes that were already fetched and verified.
    pub fn from_manifest(
        fetcher: Arc<Fetcher>,
        reference: Reference,
        raw: Bytes,
        descriptor: Descriptor,
    ) -> Result<Self> {
        check_index(&descriptor)?;
        Ok(RemoteIndex {
            fetcher,
            reference,
            manifest: OnceCell::new_with(Some((raw, descriptor))),
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn repository(&self) -> &Repository {
        self.fetcher.repository()
    }

    pub async fn descriptor(&self) -> Result<Descriptor> {
        Ok(self.fetched().await?.1.clone())
    }

    async fn fetched(&self) -> Result<&(Bytes, Descriptor)> {
        self.manifest
            .get_or_try_init(|| async {
                let (raw, descriptor) = self.fetcher.fetch_manifest(&self.reference).await?;
                check_index(&descriptor)?;
                Ok((raw, descriptor))
            })
            .await
    }

    /// Descriptor of the child with `hash`, which must be listed in this index.
    async fn child_descriptor(&self, hash: &Hash) -> Result<Descriptor> {
        self.index_manifest()
            .await?
            .manifests
            .into_iter()
            .find(|d| &d.digest == hash)
            .ok_or_else(|| {
                RegistryError::NotFound(format!("{} is not a child of {}", hash, self.reference))
            })
    }

    fn child_reference(&self, hash: &Hash) -> Reference {
        Reference::from(self.repository().digest(hash.clone()))
    }
}

fn check_index(descriptor: &Descriptor) -> Result<()> {
    if descriptor.media_type.is_index() {
        Ok(())
    } else {
        Err(RegistryError::UnexpectedMediaType(format!(
            "{} is not an index",
            descriptor.media_type
        )))
    }
}

#[async_trait]
impl Index for RemoteIndex {
    async fn media_type(&self) -> Result<MediaType> {
        Ok(self.fetched().await?.1.media_type.clone())
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.fetched().await?.0.clone())
    }

    async fn image(&self, hash: &Hash) -> Result<Arc<dyn Image>> {
        let desc = self.child_descriptor(hash).await?;
        if desc.media_type.is_index() {
            return Err(RegistryError::UnexpectedMediaType(format!(
                "child {} is an index, not an image",
                hash
            )));
        }
        Ok(Arc::new(RemoteImage::new(
            self.fetcher.clone(),
            self.child_reference(hash),
            None,
        )))
    }

    async fn index(&self, hash: &Hash) -> Result<Arc<dyn Index>> {
        let desc = self.child_descriptor(hash).await?;
        check_index(&desc)?;
        Ok(Arc::new(RemoteIndex::new(
            self.fetcher.clone(),
            self.child_reference(hash),
        )))
    }

    async fn digest(&self) -> Result<Hash> {
        Ok(self.fetched().await?.1.digest.clone())
    }
}
