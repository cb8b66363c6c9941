//! Copying artifacts between references and repository trees

pub mod recursive;

pub use recursive::{CopyTask, DigestEntry, RecursiveCopier, RecursiveStats, plan};

use crate::error::{RegistryError, Result};
use crate::image::Artifact;
use crate::reference::Reference;
use crate::remote::{self, Options, PushStats};
use tracing::{debug, info};

/// Mirror the manifest at `src` (image, index or any other media type) and
/// everything it references to `dst`.
///
/// When both live on the same registry, blobs are mounted from the source
/// repository instead of being transferred.
pub async fn copy(src: &Reference, dst: &Reference, options: &Options) -> Result<PushStats> {
    let mut mounts = options.mount().to_vec();
    if src.registry() == dst.registry() && src.context() != dst.context() {
        mounts.push(src.context().clone());
    }
    let options = options.clone().with_mount(mounts);

    let desc = remote::get(src, &options).await?;
    info!(src = %src, dst = %dst, digest = %desc.descriptor().digest, media_type = %desc.descriptor().media_type, "copying");
    match desc.artifact() {
        Ok(Artifact::Image(image)) => remote::write(dst, image.as_ref(), &options).await,
        Ok(Artifact::Index(index)) => remote::write_index(dst, index, &options).await,
        Err(RegistryError::UnexpectedMediaType(media_type)) => {
            debug!(media_type, "copying manifest bytes unchanged");
            remote::put_raw_manifest(
                dst,
                desc.raw_manifest().clone(),
                &desc.descriptor().media_type,
                &options,
            )
            .await?;
            Ok(PushStats {
                manifests: 1,
                ..PushStats::default()
            })
        }
        Err(e) => Err(e),
    }
}
