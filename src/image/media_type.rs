//! Media types for manifests, configs and layers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    OciManifest,
    OciImageIndex,
    OciConfig,
    OciLayer,
    OciUncompressedLayer,
    OciRestrictedLayer,
    OciZstdLayer,
    DockerManifestSchema1,
    DockerManifestSchema1Signed,
    DockerManifestSchema2,
    DockerManifestList,
    DockerConfig,
    DockerLayer,
    DockerUncompressedLayer,
    DockerForeignLayer,
    Other(String),
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::OciManifest => "application/vnd.oci.image.manifest.v1+json",
            MediaType::OciImageIndex => "application/vnd.oci.image.index.v1+json",
            MediaType::OciConfig => "application/vnd.oci.image.config.v1+json",
            MediaType::OciLayer => "application/vnd.oci.image.layer.v1.tar+gzip",
            MediaType::OciUncompressedLayer => "application/vnd.oci.image.layer.v1.tar",
            MediaType::OciRestrictedLayer => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
            }
            MediaType::OciZstdLayer => "application/vnd.oci.image.layer.v1.tar+zstd",
            MediaType::DockerManifestSchema1 => {
                "application/vnd.docker.distribution.manifest.v1+json"
            }
            MediaType::DockerManifestSchema1Signed => {
                "application/vnd.docker.distribution.manifest.v1+prettyjws"
            }
            MediaType::DockerManifestSchema2 => {
                "application/vnd.docker.distribution.manifest.v2+json"
            }
            MediaType::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
            MediaType::DockerConfig => "application/vnd.docker.container.image.v1+json",
            MediaType::DockerLayer => "application/vnd.docker.image.rootfs.diff.tar.gzip",
            MediaType::DockerUncompressedLayer => "application/vnd.docker.image.rootfs.diff.tar",
            MediaType::DockerForeignLayer => {
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
            }
            MediaType::Other(s) => s,
        }
    }

    /// Manifest list or OCI index.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciImageIndex | MediaType::DockerManifestList)
    }

    /// Single-platform image manifest.
    pub fn is_image(&self) -> bool {
        matches!(self, MediaType::OciManifest | MediaType::DockerManifestSchema2)
    }

    pub fn is_schema1(&self) -> bool {
        matches!(
            self,
            MediaType::DockerManifestSchema1 | MediaType::DockerManifestSchema1Signed
        )
    }

    /// Layers that may not be pushed to another registry.
    pub fn is_distributable(&self) -> bool {
        !matches!(self, MediaType::DockerForeignLayer | MediaType::OciRestrictedLayer)
    }

    /// Layers whose bytes are gzip streams.
    pub fn is_gzip(&self) -> bool {
        matches!(
            self,
            MediaType::OciLayer
                | MediaType::OciRestrictedLayer
                | MediaType::DockerLayer
                | MediaType::DockerForeignLayer
        )
    }

    pub fn is_uncompressed_layer(&self) -> bool {
        matches!(
            self,
            MediaType::OciUncompressedLayer | MediaType::DockerUncompressedLayer
        )
    }

    /// Config media type paired with this manifest media type.
    pub fn config_type(&self) -> MediaType {
        match self {
            MediaType::DockerManifestSchema2 => MediaType::DockerConfig,
            _ => MediaType::OciConfig,
        }
    }

    /// Gzip layer media type paired with this manifest media type.
    pub fn layer_type(&self) -> MediaType {
        match self {
            MediaType::DockerManifestSchema2 => MediaType::DockerLayer,
            _ => MediaType::OciLayer,
        }
    }
}

/// Every manifest type this crate requests in `Accept` headers.
pub fn accepted_manifest_types() -> Vec<MediaType> {
    vec![
        MediaType::DockerManifestSchema2,
        MediaType::DockerManifestList,
        MediaType::OciManifest,
        MediaType::OciImageIndex,
    ]
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        // Registries sometimes append parameters such as `; charset=utf-8`.
        let s = s.split(';').next().unwrap_or(s).trim();
        let known = [
            MediaType::OciManifest,
            MediaType::OciImageIndex,
            MediaType::OciConfig,
            MediaType::OciLayer,
            MediaType::OciUncompressedLayer,
            MediaType::OciRestrictedLayer,
            MediaType::OciZstdLayer,
            MediaType::DockerManifestSchema1,
            MediaType::DockerManifestSchema1Signed,
            MediaType::DockerManifestSchema2,
            MediaType::DockerManifestList,
            MediaType::DockerConfig,
            MediaType::DockerLayer,
            MediaType::DockerUncompressedLayer,
            MediaType::DockerForeignLayer,
        ];
        known
            .into_iter()
            .find(|m| m.as_str() == s)
            .unwrap_or_else(|| MediaType::Other(s.to_string()))
    }
}

impl From<String> for MediaType {
    fn from(s: String) -> Self {
        MediaType::from(s.as_str())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(MediaType::from(String::deserialize(deserializer)?))
    }
}
