use crate::error::{RegistryError, Result};
use crate::image::{Artifact, Descriptor, Platform};
use crate::reference::Reference;
use crate::remote::fetcher::Fetcher;
use crate::remote::image::RemoteImage;
use crate::remote::index::RemoteIndex;
use bytes::Bytes;
use std::sync::Arc;

/// A fetched manifest of any media type, not yet interpreted.
pub struct RemoteDescriptor {
    fetcher: Arc<Fetcher>,
    reference: Reference,
    descriptor: Descriptor,
    raw: Bytes,
    platform: Option<Platform>,
}

impl RemoteDescriptor {
    pub(crate) fn new(
        fetcher: Arc<Fetcher>,
        reference: Reference,
        raw: Bytes,
        descriptor: Descriptor,
        platform: Option<Platform>,
    ) -> Self {
        RemoteDescriptor {
            fetcher,
            reference,
            descriptor,
            raw,
            platform,
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The manifest exactly as served.
    pub fn raw_manifest(&self) -> &Bytes {
        &self.raw
    }

    /// The image, resolving an index to the configured platform.
    pub fn image(&self) -> Result<RemoteImage> {
        if self.descriptor.media_type.is_index() {
            let pinned = Reference::from(
                self.fetcher
                    .repository()
                    .digest(self.descriptor.digest.clone()),
            );
            return Ok(RemoteImage::new(
                self.fetcher.clone(),
                pinned,
                self.platform.clone(),
            ));
        }
        RemoteImage::from_manifest(
            self.fetcher.clone(),
            self.reference.clone(),
            self.raw.clone(),
            self.descriptor.clone(),
        )
    }

    pub fn index(&self) -> Result<RemoteIndex> {
        RemoteIndex::from_manifest(
            self.fetcher.clone(),
            self.reference.clone(),
            self.raw.clone(),
            self.descriptor.clone(),
        )
    }

    /// Image or index, by media type. Anything else is returned as an error
    /// so callers can fall back to the raw bytes.
    pub fn artifact(&self) -> Result<Artifact> {
        let media_type = &self.descriptor.media_type;
        if media_type.is_index() {
            Ok(Artifact::Index(Arc::new(self.index()?)))
        } else if media_type.is_image() {
            Ok(Artifact::Image(Arc::new(self.image()?)))
        } else {
            Err(RegistryError::UnexpectedMediaType(media_type.to_string()))
        }
    }
}
