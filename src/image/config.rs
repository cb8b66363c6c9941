//! Image configuration document

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::Platform;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<Hash>,
}

impl Default for RootFs {
    fn default() -> Self {
        RootFs {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// The image config blob. Only the fields the registry client needs are
/// typed; everything else round-trips through `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConfigFile {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Integrity(format!("malformed image config: {}", e)))
    }

    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
            os_version: self.os_version.clone(),
            ..Default::default()
        }
    }

    pub fn diff_ids(&self) -> &[Hash] {
        &self.rootfs.diff_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_survive() {
        let json = r#"{"architecture":"amd64","config":{"Env":["PATH=/bin"]},"os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
        let cfg = ConfigFile::from_slice(json.as_bytes()).unwrap();
        assert_eq!(cfg.platform().to_string(), "linux/amd64");
        assert!(cfg.extra.contains_key("config"));
        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["config"]["Env"][0], "PATH=/bin");
    }

    #[test]
    fn test_diff_ids_parse() {
        let hash = Hash::of(b"layer");
        let json = format!(r#"{{"rootfs":{{"type":"layers","diff_ids":["{}"]}}}}"#, hash);
        let cfg = ConfigFile::from_slice(json.as_bytes()).unwrap();
        assert_eq!(cfg.diff_ids(), &[hash]);
    }
}
