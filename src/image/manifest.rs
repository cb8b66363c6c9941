//! Manifest, index and descriptor documents

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::MediaType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A `(media-type, size, digest)` pointer to a blob or child manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: MediaType,
    pub size: u64,
    pub digest: Hash,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: MediaType, size: u64, digest: Hash) -> Self {
        Descriptor {
            media_type,
            size,
            digest,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
            artifact_type: None,
        }
    }

    /// Descriptor for an in-memory blob.
    pub fn for_bytes(media_type: MediaType, data: &[u8]) -> Self {
        Descriptor::new(media_type, data.len() as u64, Hash::of(data))
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

impl Manifest {
    pub fn new(media_type: MediaType, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Manifest {
            schema_version: 2,
            media_type: Some(media_type),
            config,
            layers,
            annotations: BTreeMap::new(),
            subject: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Integrity(format!("malformed manifest: {}", e)))
    }

    /// The media type of the document, defaulting to OCI when absent.
    pub fn media_type(&self) -> MediaType {
        self.media_type.clone().unwrap_or(MediaType::OciManifest)
    }

    /// Every blob this manifest references, config first.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Manifest list or OCI image index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

impl IndexManifest {
    pub fn new(media_type: MediaType, manifests: Vec<Descriptor>) -> Self {
        IndexManifest {
            schema_version: 2,
            media_type: Some(media_type),
            manifests,
            annotations: BTreeMap::new(),
            subject: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Integrity(format!("malformed index: {}", e)))
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type.clone().unwrap_or(MediaType::OciImageIndex)
    }

    /// First image child whose platform satisfies `wanted`.
    pub fn find_platform(&self, wanted: &Platform) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .filter(|d| !d.media_type.is_index())
            .find(|d| d.platform.as_ref().is_some_and(|p| p.satisfies(wanted)))
    }
}

/// Just enough of a manifest to learn its media type.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Sniff {
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub manifests: Option<serde_json::Value>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Guess the media type of manifest bytes that arrived without a usable
/// `Content-Type`.
pub(crate) fn sniff_media_type(data: &[u8]) -> Option<MediaType> {
    let sniff: Sniff = serde_json::from_slice(data).ok()?;
    match (sniff.media_type, sniff.manifests, sniff.config) {
        (Some(mt), _, _) => Some(mt),
        (None, Some(_), _) => Some(MediaType::OciImageIndex),
        (None, None, Some(_)) => Some(MediaType::OciManifest),
        _ => None,
    }
}

/// Target platform of an image, e.g. `linux/arm64/v8`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            ..Default::default()
        }
    }

    /// Whether `self` (a concrete platform from an index) satisfies the
    /// `wanted` platform. Empty fields in `wanted` match anything.
    pub fn satisfies(&self, wanted: &Platform) -> bool {
        if !wanted.os.is_empty() && self.os != wanted.os {
            return false;
        }
        if !wanted.architecture.is_empty() && self.architecture != wanted.architecture {
            return false;
        }
        if let Some(variant) = &wanted.variant {
            if self.variant.as_deref() != Some(variant.as_str()) {
                return false;
            }
        }
        if let Some(version) = &wanted.os_version {
            if self.os_version.as_deref() != Some(version.as_str()) {
                return false;
            }
        }
        wanted.os_features.iter().all(|f| self.os_features.contains(f))
            && wanted.features.iter().all(|f| self.features.contains(f))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        if let Some(version) = &self.os_version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let (spec, os_version) = match s.split_once(':') {
            Some((spec, version)) => (spec, Some(version.to_string())),
            None => (s, None),
        };
        let parts: Vec<&str> = spec.split('/').collect();
        let invalid = || RegistryError::Config(format!("invalid platform {:?}", s));
        let (os, architecture, variant) = match parts.as_slice() {
            [os] => (*os, "", None),
            [os, arch] => (*os, *arch, None),
            [os, arch, variant] => (*os, *arch, Some(variant.to_string())),
            _ => return Err(invalid()),
        };
        if os.is_empty() {
            return Err(invalid());
        }
        Ok(Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant,
            os_version,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:feb5d9fea6a5e9606aa995e879d862b825965ba48de054caab5ef356dc6b3412"
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "size": 2479,
            "digest": "sha256:2db29710123e3e53a794f2694094b9b4338aa9ee5c40b930cb8063a1be392c54"
        }]
    }"#;

    #[test]
    fn test_parse_docker_manifest() {
        let m = Manifest::from_slice(DOCKER_MANIFEST.as_bytes()).unwrap();
        assert_eq!(m.media_type(), MediaType::DockerManifestSchema2);
        assert_eq!(m.config.media_type, MediaType::DockerConfig);
        assert_eq!(m.layers.len(), 1);
        assert_eq!(m.layers[0].size, 2479);
        assert_eq!(m.blobs().count(), 2);
    }

    #[test]
    fn test_serialize_omits_empty_fields() {
        let config = Descriptor::for_bytes(MediaType::OciConfig, b"{}");
        let m = Manifest::new(MediaType::OciManifest, config, vec![]);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.starts_with(r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":"#));
        assert!(!json.contains("annotations"));
        assert!(!json.contains("urls"));
    }

    #[test]
    fn test_malformed_manifest_is_integrity_error() {
        let err = Manifest::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, RegistryError::Integrity(_)));
    }

    #[test]
    fn test_sniff() {
        assert!(sniff_media_type(br#"{"schemaVersion":2,"manifests":[]}"#).unwrap().is_index());
        assert!(sniff_media_type(DOCKER_MANIFEST.as_bytes()).unwrap().is_image());
        assert_eq!(sniff_media_type(b"[]"), None);
    }

    #[test]
    fn test_platform_parse_and_match() {
        let wanted: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(wanted.variant.as_deref(), Some("v8"));
        assert_eq!(wanted.to_string(), "linux/arm64/v8");

        let mut candidate = Platform::new("linux", "arm64");
        assert!(!candidate.satisfies(&wanted));
        candidate.variant = Some("v8".into());
        assert!(candidate.satisfies(&wanted));
        assert!(candidate.satisfies(&"linux".parse().unwrap()));
        assert!(!candidate.satisfies(&"windows/amd64".parse().unwrap()));
        assert!("".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn test_platform_os_version_field_names() {
        let json = r#"{"architecture":"amd64","os":"windows","os.version":"10.0.17763.1879"}"#;
        let p: Platform = serde_json::from_str(json).unwrap();
        assert_eq!(p.os_version.as_deref(), Some("10.0.17763.1879"));
        assert_eq!(serde_json::to_string(&p).unwrap(), json);
    }
}
