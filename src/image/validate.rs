//! Full consistency checks over an image or index
//!
//! These read every blob, so they are meant for tests and for the `validate`
//! command, not for the hot path.

use crate::error::{RegistryError, Result};
use crate::hash::{Hash, sha256};
use crate::image::{Artifact, Image, Index};
use std::sync::Arc;
use tracing::debug;

/// Check the manifest, config and every layer of `image` against each other.
pub async fn validate_image(image: &dyn Image) -> Result<()> {
    let raw = image.raw_manifest().await?;
    let digest = image.digest().await?;
    if Hash::of(&raw) != digest {
        return Err(RegistryError::Integrity(format!(
            "manifest digest {} does not match its bytes",
            digest
        )));
    }

    let manifest = image.manifest().await?;
    let raw_config = image.raw_config().await?;
    check_blob(
        "config",
        &manifest.config.digest,
        manifest.config.size,
        &Hash::of(&raw_config),
        raw_config.len() as u64,
    )?;

    let config = image.config_file().await?;
    let layers = image.layers().await?;
    if layers.len() != manifest.layers.len() || config.diff_ids().len() != manifest.layers.len() {
        return Err(RegistryError::Integrity(format!(
            "{} layers in manifest, {} layers in image, {} diff ids in config",
            manifest.layers.len(),
            layers.len(),
            config.diff_ids().len()
        )));
    }

    for ((desc, layer), diff_id) in manifest.layers.iter().zip(&layers).zip(config.diff_ids()) {
        if layer.digest() != &desc.digest {
            return Err(RegistryError::Integrity(format!(
                "layer {} out of order, manifest expects {}",
                layer.digest(),
                desc.digest
            )));
        }
        let (got, size) = sha256(layer.compressed().await?).await?;
        check_blob("layer", &desc.digest, desc.size, &got, size)?;

        let (got_diff_id, _) = sha256(layer.uncompressed().await?).await?;
        if &got_diff_id != diff_id {
            return Err(RegistryError::Integrity(format!(
                "layer {} uncompresses to {}, config expects {}",
                desc.digest, got_diff_id, diff_id
            )));
        }
        debug!(layer = %desc.digest, "layer verified");
    }
    Ok(())
}

/// Check an index and, recursively, all of its children.
pub async fn validate_index(index: Arc<dyn Index>) -> Result<()> {
    let manifest = index.index_manifest().await?;
    for desc in &manifest.manifests {
        let child = index.child(desc).await?;
        let raw = child.raw_manifest().await?;
        check_blob(
            "child manifest",
            &desc.digest,
            desc.size,
            &Hash::of(&raw),
            raw.len() as u64,
        )?;
        match child {
            Artifact::Image(img) => validate_image(img.as_ref()).await?,
            Artifact::Index(idx) => Box::pin(validate_index(idx)).await?,
        }
    }
    Ok(())
}

fn check_blob(what: &str, want: &Hash, want_size: u64, got: &Hash, got_size: u64) -> Result<()> {
    if want != got {
        return Err(RegistryError::Integrity(format!(
            "{} digest mismatch: expected {}, got {}",
            what, want, got
        )));
    }
    if want_size != got_size {
        return Err(RegistryError::Integrity(format!(
            "{} {} size mismatch: expected {}, got {}",
            what, want, want_size, got_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{BytesLayer, ConfigFile, Layer, MediaType, MemoryImage, MemoryIndex};

    fn layers(contents: &[&[u8]]) -> Vec<Arc<dyn Layer>> {
        contents
            .iter()
            .map(|c| Arc::new(BytesLayer::gzip(c.to_vec()).unwrap()) as Arc<dyn Layer>)
            .collect()
    }

    #[tokio::test]
    async fn test_valid_image_with_empty_layer() {
        let img = MemoryImage::new(
            MediaType::DockerManifestSchema2,
            ConfigFile::default(),
            layers(&[b"a", b""]),
        )
        .unwrap();
        validate_image(&img).await.unwrap();
    }

    #[tokio::test]
    async fn test_swapped_layers_fail() {
        let good =
            MemoryImage::new(MediaType::OciManifest, ConfigFile::default(), layers(&[b"a", b"b"]))
                .unwrap();
        let mut swapped = good.layers().await.unwrap();
        swapped.reverse();
        let bad = MemoryImage::from_raw(
            good.raw_manifest().await.unwrap(),
            good.raw_config().await.unwrap(),
            swapped,
        )
        .unwrap();
        let err = validate_image(&bad).await.unwrap_err();
        assert!(matches!(err, RegistryError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_nested_index() {
        let img = MemoryImage::new(MediaType::OciManifest, ConfigFile::default(), layers(&[b"x"]))
            .unwrap();
        let inner = Artifact::Index(Arc::new(
            MemoryIndex::new(MediaType::OciImageIndex, vec![(Artifact::Image(Arc::new(img)), None)])
                .await
                .unwrap(),
        ));
        let outer = MemoryIndex::new(MediaType::OciImageIndex, vec![(inner, None)])
            .await
            .unwrap();
        validate_index(Arc::new(outer)).await.unwrap();
    }
}
