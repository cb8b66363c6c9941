//! Credential resolution
//!
//! A [`Keychain`] maps a registry or repository to an [`Authenticator`].
//! The default keychain reads the docker config file and runs credential
//! helpers; the others cover GitHub, Kubernetes pull secrets, caching and
//! ordered composition.

pub mod config_file;
pub mod default;
pub mod github;
pub mod helper;
pub mod k8s;

pub use config_file::DockerConfig;
pub use default::{DefaultKeychain, DefaultKeychainBuilder, default_keychain};
pub use github::GithubKeychain;
pub use k8s::K8sKeychain;

use crate::error::Result;
use crate::reference::Resource;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Credentials in the shape the docker config file stores them.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawAuthConfig", into = "RawAuthConfig")]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub identity_token: String,
    pub registry_token: String,
}

impl AuthConfig {
    pub fn basic(username: &str, password: &str) -> Self {
        AuthConfig {
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    /// `base64(username:password)`, empty when there is no username.
    pub fn auth(&self) -> String {
        if self.username.is_empty() && self.password.is_empty() {
            return String::new();
        }
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("identity_token", &redacted(&self.identity_token))
            .field("registry_token", &redacted(&self.registry_token))
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "<redacted>" }
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct RawAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(rename = "identitytoken", default, skip_serializing_if = "Option::is_none")]
    identity_token: Option<String>,
    #[serde(rename = "registrytoken", default, skip_serializing_if = "Option::is_none")]
    registry_token: Option<String>,
}

impl From<RawAuthConfig> for AuthConfig {
    fn from(raw: RawAuthConfig) -> Self {
        let mut config = AuthConfig {
            username: raw.username.unwrap_or_default(),
            password: raw.password.unwrap_or_default(),
            identity_token: raw.identity_token.unwrap_or_default(),
            registry_token: raw.registry_token.unwrap_or_default(),
        };
        if config.username.is_empty() && config.password.is_empty() {
            if let Some((user, pass)) = raw.auth.as_deref().and_then(decode_auth) {
                config.username = user;
                config.password = pass;
            }
        }
        config
    }
}

impl From<AuthConfig> for RawAuthConfig {
    fn from(config: AuthConfig) -> Self {
        let some = |s: String| if s.is_empty() { None } else { Some(s) };
        RawAuthConfig {
            auth: some(config.auth()),
            username: some(config.username),
            password: some(config.password),
            identity_token: some(config.identity_token),
            registry_token: some(config.registry_token),
        }
    }
}

/// Decode the `auth` field of a config entry.
pub(crate) fn decode_auth(auth: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(auth.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// How to authenticate against one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Authenticator {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// A registry token sent as is.
    Bearer(String),
    Config(AuthConfig),
}

impl Authenticator {
    pub fn basic(username: &str, password: &str) -> Self {
        Authenticator::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Collapse empty configs to the anonymous sentinel.
    pub fn from_config(config: AuthConfig) -> Self {
        if config.is_empty() {
            Authenticator::Anonymous
        } else {
            Authenticator::Config(config)
        }
    }

    pub fn is_anonymous(&self) -> bool {
        *self == Authenticator::Anonymous
    }

    pub fn authorization(&self) -> AuthConfig {
        match self {
            Authenticator::Anonymous => AuthConfig::default(),
            Authenticator::Basic { username, password } => AuthConfig::basic(username, password),
            Authenticator::Bearer(token) => AuthConfig {
                registry_token: token.clone(),
                ..Default::default()
            },
            Authenticator::Config(config) => config.clone(),
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::Anonymous => f.write_str("Anonymous"),
            Authenticator::Basic { username, .. } => write!(f, "Basic({})", username),
            Authenticator::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Authenticator::Config(config) => write!(f, "Config({:?})", config),
        }
    }
}

#[async_trait]
pub trait Keychain: Send + Sync {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator>;
}

/// Always anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousKeychain;

#[async_trait]
impl Keychain for AnonymousKeychain {
    async fn resolve(&self, _target: &dyn Resource) -> Result<Authenticator> {
        Ok(Authenticator::Anonymous)
    }
}

/// Ordered composition: the first non-anonymous answer wins.
#[derive(Clone)]
pub struct MultiKeychain {
    keychains: Vec<Arc<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new(keychains: Vec<Arc<dyn Keychain>>) -> Self {
        MultiKeychain { keychains }
    }
}

#[async_trait]
impl Keychain for MultiKeychain {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator> {
        for keychain in &self.keychains {
            let auth = keychain.resolve(target).await?;
            if !auth.is_anonymous() {
                return Ok(auth);
            }
        }
        Ok(Authenticator::Anonymous)
    }
}

/// Remembers each answer of the inner keychain per target.
pub struct CachedKeychain {
    inner: Arc<dyn Keychain>,
    cache: Mutex<HashMap<String, Authenticator>>,
}

impl CachedKeychain {
    pub fn new(inner: Arc<dyn Keychain>) -> Self {
        CachedKeychain {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Keychain for CachedKeychain {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator> {
        let key = target.string();
        // The lock is held across the lookup so a helper runs once per target.
        let mut cache = self.cache.lock().await;
        if let Some(auth) = cache.get(&key) {
            return Ok(auth.clone());
        }
        let auth = self.inner.resolve(target).await?;
        cache.insert(key, auth.clone());
        Ok(auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{Registry, Validation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Authenticator, AtomicUsize);

    #[async_trait]
    impl Keychain for Fixed {
        async fn resolve(&self, _target: &dyn Resource) -> Result<Authenticator> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.clone())
        }
    }

    fn registry() -> Registry {
        Registry::new("registry.example", Validation::Weak).unwrap()
    }

    #[test]
    fn test_auth_field_decodes() {
        let cfg: AuthConfig = serde_json::from_str(r#"{"auth":"dXNlcjpwYXNz"}"#).unwrap();
        assert_eq!(cfg.username, "user");
        assert_eq!(cfg.password, "pass");
    }

    #[test]
    fn test_marshal_recomputes_auth() {
        let cfg: AuthConfig =
            serde_json::from_str(r#"{"username":"user","password":"pass","auth":"c3RhbGU6c3RhbGU="}"#)
                .unwrap();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["auth"], "dXNlcjpwYXNz");
        assert!(json.get("identitytoken").is_none());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = Authenticator::Config(AuthConfig::basic("user", "hunter2"));
        assert!(!format!("{:?}", auth).contains("hunter2"));
        assert!(Authenticator::from_config(AuthConfig::default()).is_anonymous());
    }

    #[tokio::test]
    async fn test_multi_first_non_anonymous_wins() {
        let multi = MultiKeychain::new(vec![
            Arc::new(AnonymousKeychain),
            Arc::new(Fixed(Authenticator::basic("a", "1"), AtomicUsize::new(0))),
            Arc::new(Fixed(Authenticator::basic("b", "2"), AtomicUsize::new(0))),
        ]);
        let auth = multi.resolve(&registry()).await.unwrap();
        assert_eq!(auth, Authenticator::basic("a", "1"));
    }

    #[tokio::test]
    async fn test_cached_resolves_once() {
        let inner = Arc::new(Fixed(Authenticator::basic("a", "1"), AtomicUsize::new(0)));
        let cached = CachedKeychain::new(inner.clone());
        for _ in 0..3 {
            cached.resolve(&registry()).await.unwrap();
        }
        assert_eq!(inner.1.load(Ordering::SeqCst), 1);
    }
}
