//! Credentials for GitHub Container Registry from the environment

use crate::error::Result;
use crate::keychain::{Authenticator, Keychain};
use crate::reference::Resource;
use async_trait::async_trait;

pub const GHCR_HOST: &str = "ghcr.io";

/// Uses `GITHUB_TOKEN` (and `GITHUB_ACTOR`, if set) for `ghcr.io`.
#[derive(Clone, Default)]
pub struct GithubKeychain {
    actor: Option<String>,
    token: Option<String>,
}

impl GithubKeychain {
    pub fn new(actor: Option<String>, token: Option<String>) -> Self {
        GithubKeychain { actor, token }
    }

    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        GithubKeychain::new(var("GITHUB_ACTOR"), var("GITHUB_TOKEN"))
    }
}

#[async_trait]
impl Keychain for GithubKeychain {
    async fn resolve(&self, target: &dyn Resource) -> Result<Authenticator> {
        match &self.token {
            Some(token) if target.registry_str() == GHCR_HOST => Ok(Authenticator::basic(
                self.actor.as_deref().unwrap_or("unset"),
                token,
            )),
            _ => Ok(Authenticator::Anonymous),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{Repository, Validation};

    #[tokio::test]
    async fn test_only_ghcr() {
        let kc = GithubKeychain::new(None, Some("ghp_token".into()));
        let ghcr = Repository::new("ghcr.io/org/app", Validation::Weak).unwrap();
        let other = Repository::new("quay.io/org/app", Validation::Weak).unwrap();
        assert_eq!(kc.resolve(&ghcr).await.unwrap(), Authenticator::basic("unset", "ghp_token"));
        assert!(kc.resolve(&other).await.unwrap().is_anonymous());
        assert!(GithubKeychain::default().resolve(&ghcr).await.unwrap().is_anonymous());
    }
}
