//! Docker `config.json` (and Podman `auth.json`) parsing

use crate::error::{RegistryError, Result};
use crate::keychain::AuthConfig;
use crate::reference::DEFAULT_REGISTRY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Key docker uses for Docker Hub credentials.
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, AuthConfig>,
    #[serde(rename = "credHelpers", default)]
    pub cred_helpers: HashMap<String, String>,
    #[serde(rename = "credsStore", default, skip_serializing_if = "Option::is_none")]
    pub creds_store: Option<String>,
}

impl DockerConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Config(format!("failed to parse docker config: {}", e)))
    }

    /// `None` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(data) => Self::from_slice(&data)
                .map(Some)
                .map_err(|e| RegistryError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RegistryError::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Credential helper responsible for `registry`. A per-host helper
    /// overrides the global store.
    pub fn helper_for(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .get(registry)
            .or_else(|| {
                (registry == DEFAULT_REGISTRY)
                    .then(|| self.cred_helpers.get(DOCKER_HUB_AUTH_KEY))
                    .flatten()
            })
            .or(self.creds_store.as_ref())
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Inline credentials for `registry`, trying the exact key first and then
    /// keys that differ only by scheme or a `/v1/`, `/v2/` suffix.
    pub fn find_auth(&self, registry: &str) -> Option<&AuthConfig> {
        if let Some(auth) = self.auths.get(registry) {
            return Some(auth);
        }
        if registry == DEFAULT_REGISTRY {
            if let Some(auth) = self.auths.get(DOCKER_HUB_AUTH_KEY) {
                return Some(auth);
            }
        }
        let mut candidates: Vec<(&String, &AuthConfig)> = self
            .auths
            .iter()
            .filter(|(key, _)| {
                let host = hostname_of(key);
                host == registry
                    || (registry == DEFAULT_REGISTRY && host == "docker.io")
            })
            .collect();
        // Deterministic pick when several spellings are present.
        candidates.sort_by(|a, b| a.0.cmp(b.0));
        candidates.first().map(|(_, auth)| *auth)
    }
}

/// Strip scheme and trailing API path from a config key.
pub(crate) fn hostname_of(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

/// Server URL handed to credential helpers for `registry`.
pub(crate) fn helper_server_url(registry: &str) -> String {
    if registry == DEFAULT_REGISTRY {
        DOCKER_HUB_AUTH_KEY.to_string()
    } else {
        registry.to_string()
    }
}
