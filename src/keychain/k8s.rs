//! Kubernetes image-pull-secret style matching
//!
//! Keys of a `.dockerconfigjson` document may carry a path and `*`
//! wildcards in host labels. The entry with the longest matching key wins.

use crate::error::{RegistryError, Result};
use crate::keychain::{AuthConfig, Authenticator, DockerConfig, Keychain};
use crate::reference::Resource;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    key_len: usize,
    host: String,
    port: Option<String>,
    path: String,
    auth: AuthConfig,
}

#[derive(Debug, Clone, Default)]
pub struct K8sKeychain {
    entries: Vec<Entry>,
}

impl K8sKeychain {
    pub fn new(auths: HashMap<String, AuthConfig>) -> Self {
        let mut entries: Vec<Entry> = auths
            .into_iter()
            .map(|(key, auth)| {
                let (host, port, path) = split_key(&key);
                Entry {
                    key_len: host.len() + path.len(),
                    host,
                    port,
                    path,
                    auth,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.key_len.cmp(&a.key_len).then_with(|| a.host.cmp(&b.host)));
        K8sKeychain { entries }
    }

    /// Accepts both `{"auths": {...}}` and the legacy bare map.
    pub fn from_docker_config_json(data: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| RegistryError::Config(format!("invalid pull secret: {}", e)))?;
        let auths = if value.get("auths").is_some() {
            serde_json::from_value::<DockerConfig>(value)?.auths
        } else {
            serde_json::from_value(value)?
        };
        Ok(K8sKeychain::new(auths))
    }

    fn lookup(&self, image: &str) -> Option<&AuthConfig> {
        let (host, port, path) = split_key(image);
        self.entries
            .iter()
            .find(|e| {
                e.port == port && host_matches(&e.host, &host) && path_matches(&e.path, &path)
            })
            .map(|e| &e.auth)
    }
}

#[async_trait]
impl Keychain for K8sKeychain {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator> {
        Ok(self
            .lookup(&target.string())
            .cloned()
            .map(Authenticator::from_config)
            .unwrap_or(Authenticator::Anonymous))
    }
}

/// Split `[scheme://]host[:port][/path]` into its parts. Bare `/v1/` and
/// `/v2/` paths are dropped.
fn split_key(key: &str) -> (String, Option<String>, String) {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let (authority, path) = key.split_once('/').unwrap_or((key, ""));
    let path = path.trim_end_matches('/');
    let path = if path == "v1" || path == "v2" { "" } else { path };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host, Some(port.to_string()))
        }
        _ => (authority, None),
    };
    (host.to_ascii_lowercase(), port, path.to_string())
}

/// Label-wise glob match; `*` may stand for a whole label or a prefix of one.
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let host: Vec<&str> = host.split('.').collect();
    pattern.len() == host.len()
        && pattern.iter().zip(&host).all(|(p, h)| match p.strip_suffix('*') {
            Some(prefix) => h.starts_with(prefix),
            None => p == h,
        })
}

/// Component-wise prefix match.
fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    path == pattern || path.starts_with(&format!("{}/", pattern))
}
