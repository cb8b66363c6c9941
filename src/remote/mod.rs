//! Reading from and writing to registries
//!
//! The free functions here are the entry points: each resolves credentials
//! through [`Options`], builds a transport scoped to the repository it
//! touches and returns lazily fetched artifacts or push statistics.
//!
//! ```no_run
//! # async fn demo() -> oci_crane::error::Result<()> {
//! use oci_crane::reference::{Reference, Validation};
//! use oci_crane::remote::{self, Options};
//!
//! let src = Reference::parse("gcr.io/project/app:v1", Validation::Weak)?;
//! let dst = Reference::parse("registry.example/app:v1", Validation::Weak)?;
//! let options = Options::new();
//! let image = remote::image(&src, &options).await?;
//! remote::write(&dst, &image, &options).await?;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod fetcher;
pub mod image;
pub mod index;
pub mod list;
pub mod options;
pub mod upload;
pub mod walk;
pub mod write;

pub use descriptor::RemoteDescriptor;
pub use fetcher::Fetcher;
pub use image::{RemoteImage, RemoteLayer, default_platform};
pub use index::RemoteIndex;
pub use list::{ManifestInfo, Tags, catalog, list, list_tags};
pub use options::{DEFAULT_CHUNK_SIZE, Options, USER_AGENT, default_jobs};
pub use upload::BlobOutcome;
pub use walk::walk;
pub use write::{PushStats, Writer};

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::{Artifact, Descriptor, Image, Index, MediaType};
use crate::reference::{Digest, Reference, Repository, Tag};
use bytes::Bytes;
use std::sync::Arc;
use write::write_identifier;

async fn fetcher(reference: &Reference, options: &Options) -> Result<Arc<Fetcher>> {
    Ok(Arc::new(Fetcher::new(reference.context(), options).await?))
}

/// Fetch the manifest `reference` points at, whatever its media type.
pub async fn get(reference: &Reference, options: &Options) -> Result<RemoteDescriptor> {
    let fetcher = fetcher(reference, options).await?;
    let (raw, descriptor) = fetcher.fetch_manifest(reference).await?;
    Ok(RemoteDescriptor::new(
        fetcher,
        reference.clone(),
        raw,
        descriptor,
        options.platform().cloned(),
    ))
}

/// Descriptor of the manifest `reference` points at, via HEAD.
pub async fn head(reference: &Reference, options: &Options) -> Result<Descriptor> {
    fetcher(reference, options)
        .await?
        .head_manifest(reference)
        .await
}

/// The image at `reference`. An index resolves to the child for
/// [`Options::with_platform`], defaulting to linux/amd64.
pub async fn image(reference: &Reference, options: &Options) -> Result<RemoteImage> {
    get(reference, options).await?.image()
}

pub async fn index(reference: &Reference, options: &Options) -> Result<RemoteIndex> {
    get(reference, options).await?.index()
}

/// A single blob. Its size comes from a HEAD request.
pub async fn layer(digest: &Digest, options: &Options) -> Result<RemoteLayer> {
    let fetcher = Arc::new(Fetcher::new(digest.repository(), options).await?);
    let size = fetcher
        .head_blob(digest.hash())
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))?;
    let descriptor = Descriptor::new(MediaType::OciLayer, size, digest.hash().clone());
    Ok(RemoteLayer::new(fetcher, descriptor, None))
}

/// Push `image` and tag it (or pin it by digest) at `reference`.
pub async fn write(reference: &Reference, image: &dyn Image, options: &Options) -> Result<PushStats> {
    let identifier = write_identifier(reference, &image.digest().await?)?;
    let sources: Vec<Repository> = image
        .layers()
        .await?
        .iter()
        .filter_map(|l| l.mount_source().cloned())
        .collect();
    let writer = Writer::new(reference.context(), options, &sources).await?;
    writer.write_image(image, &identifier).await
}

/// Push every child of `index`, then the index itself.
pub async fn write_index(
    reference: &Reference,
    index: Arc<dyn Index>,
    options: &Options,
) -> Result<PushStats> {
    let identifier = write_identifier(reference, &index.digest().await?)?;
    let writer = Writer::new(reference.context(), options, &[]).await?;
    writer.write_index(index, &identifier).await
}

pub async fn write_artifact(
    reference: &Reference,
    artifact: &Artifact,
    options: &Options,
) -> Result<PushStats> {
    match artifact {
        Artifact::Image(img) => write(reference, img.as_ref(), options).await,
        Artifact::Index(idx) => write_index(reference, idx.clone(), options).await,
    }
}

/// Point `tag` at an artifact whose content is already in the repository.
pub async fn tag(tag: &Tag, artifact: &Artifact, options: &Options) -> Result<Hash> {
    let writer = Writer::new(tag.repository(), options, &[]).await?;
    writer
        .put_manifest(tag.tag(), artifact.raw_manifest().await?, &artifact.media_type().await?)
        .await
}

/// PUT manifest bytes of any media type unchanged.
pub async fn put_raw_manifest(
    reference: &Reference,
    raw: Bytes,
    media_type: &MediaType,
    options: &Options,
) -> Result<Hash> {
    let identifier = write_identifier(reference, &Hash::of(&raw))?;
    let writer = Writer::new(reference.context(), options, &[]).await?;
    writer.put_manifest(&identifier, raw, media_type).await
}

/// Delete the manifest at `reference`. Most registries require a digest.
pub async fn delete(reference: &Reference, options: &Options) -> Result<()> {
    let writer = Writer::new(reference.context(), options, &[]).await?;
    writer.delete_manifest(&reference.identifier()).await
}

pub async fn delete_blob(digest: &Digest, options: &Options) -> Result<()> {
    let writer = Writer::new(digest.repository(), options, &[]).await?;
    writer.delete_blob(digest.hash()).await
}
