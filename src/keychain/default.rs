//! The config-file driven default keychain

use crate::error::Result;
use crate::keychain::config_file::helper_server_url;
use crate::keychain::helper::CredentialHelper;
use crate::keychain::{
    Authenticator, CachedKeychain, DockerConfig, GithubKeychain, Keychain, MultiKeychain,
};
use crate::reference::Resource;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Resolves credentials from the first config file found in
/// `$DOCKER_CONFIG/config.json`, `$HOME/.docker/config.json` or
/// `$XDG_RUNTIME_DIR/containers/auth.json`.
#[derive(Debug, Clone, Default)]
pub struct DefaultKeychain {
    config_path: Option<PathBuf>,
    helper_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct DefaultKeychainBuilder {
    config_path: Option<PathBuf>,
    helper_dir: Option<PathBuf>,
}

impl DefaultKeychainBuilder {
    /// Read exactly this file instead of searching the environment.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Directory holding `docker-credential-*` binaries.
    pub fn helper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> DefaultKeychain {
        DefaultKeychain {
            config_path: self.config_path,
            helper_dir: self.helper_dir,
        }
    }
}

impl DefaultKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DefaultKeychainBuilder {
        DefaultKeychainBuilder::default()
    }

    /// Candidate config files in precedence order.
    fn candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.config_path {
            return vec![path.clone()];
        }
        let mut paths = Vec::new();
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            paths.push(PathBuf::from(dir).join("config.json"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".docker").join("config.json"));
        }
        if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") {
            paths.push(PathBuf::from(runtime).join("containers").join("auth.json"));
        }
        paths
    }

    async fn load_config(&self) -> Result<Option<DockerConfig>> {
        for path in self.candidates() {
            if let Some(config) = DockerConfig::load(&path).await? {
                debug!(path = %path.display(), "using credential config");
                return Ok(Some(config));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Keychain for DefaultKeychain {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator> {
        let Some(config) = self.load_config().await? else {
            return Ok(Authenticator::Anonymous);
        };
        let registry = target.registry_str();

        if let Some(name) = config.helper_for(&registry) {
            let helper = CredentialHelper::new(name).in_dir(self.helper_dir.clone());
            return Ok(match helper.get(&helper_server_url(&registry)).await? {
                Some(auth) => Authenticator::from_config(auth),
                None => Authenticator::Anonymous,
            });
        }

        Ok(config
            .find_auth(&registry)
            .cloned()
            .map(Authenticator::from_config)
            .unwrap_or(Authenticator::Anonymous))
    }
}

static DEFAULT_KEYCHAIN: OnceLock<Arc<dyn Keychain>> = OnceLock::new();

/// Process-wide keychain: config file and helpers, then GitHub, cached per
/// target. Built on first use and never replaced.
pub fn default_keychain() -> Arc<dyn Keychain> {
    DEFAULT_KEYCHAIN
        .get_or_init(|| {
            Arc::new(CachedKeychain::new(Arc::new(MultiKeychain::new(vec![
                Arc::new(DefaultKeychain::new()),
                Arc::new(GithubKeychain::from_env()),
            ]))))
        })
        .clone()
}
