use crate::error::{RegistryError, Result};
use crate::reference::{Repository, Resource, Validation};
use std::fmt;

/// Canonical host of Docker Hub.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Short alias users type for Docker Hub.
const DOCKER_HUB_ALIAS: &str = "docker.io";

/// A registry host with optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Registry {
    name: String,
    insecure: bool,
}

impl Registry {
    pub fn new(name: &str, validation: Validation) -> Result<Self> {
        if name.is_empty() {
            if validation == Validation::Strict {
                return Err(RegistryError::InvalidReference(
                    "strict validation requires the registry to be explicitly specified"
                        .to_string(),
                ));
            }
            return Ok(Self::default_registry());
        }
        check_host(name)?;
        let name = if name == DOCKER_HUB_ALIAS {
            DEFAULT_REGISTRY
        } else {
            name
        };
        Ok(Registry {
            name: name.to_string(),
            insecure: false,
        })
    }

    pub fn default_registry() -> Self {
        Registry {
            name: DEFAULT_REGISTRY.to_string(),
            insecure: false,
        }
    }

    /// Allow plain http for this registry.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_REGISTRY
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Hosts that conventionally serve plain http during development.
    pub fn is_local(&self) -> bool {
        let host = self.host();
        host == "localhost"
            || host.starts_with("127.")
            || host == "[::1]"
            || host.ends_with(".local")
            || host.ends_with(".localhost")
    }

    /// Whether a ping may fall back to http.
    pub fn allows_http(&self) -> bool {
        self.insecure || self.is_local()
    }

    /// Preferred scheme for URLs when no ping result is available.
    pub fn scheme(&self) -> &'static str {
        if self.allows_http() { "http" } else { "https" }
    }

    /// Host without port.
    pub fn host(&self) -> &str {
        if self.name.starts_with('[') {
            return match self.name.find(']') {
                Some(end) => &self.name[..=end],
                None => &self.name,
            };
        }
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// Scope string for registry-wide operations such as the catalog.
    pub fn scope(&self, _action: &str) -> String {
        "registry:catalog:*".to_string()
    }

    pub fn repository(&self, name: &str) -> Result<Repository> {
        Repository::in_registry(self.clone(), name, Validation::Weak)
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Resource for Registry {
    fn string(&self) -> String {
        self.name.clone()
    }

    fn registry_str(&self) -> String {
        self.name.clone()
    }
}

fn check_host(name: &str) -> Result<()> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if !valid || name.starts_with('.') || name.starts_with('-') || name.ends_with(':') {
        return Err(RegistryError::InvalidReference(format!(
            "registry {:?} contains invalid characters",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selection() {
        let r = Registry::new("localhost:5000", Validation::Weak).unwrap();
        assert!(r.is_local());
        assert_eq!(r.scheme(), "http");
        assert_eq!(r.host(), "localhost");

        let r = Registry::new("gcr.io", Validation::Weak).unwrap();
        assert_eq!(r.scheme(), "https");
        assert_eq!(r.with_insecure(true).scheme(), "http");

        let r = Registry::new("[::1]:5000", Validation::Weak).unwrap();
        assert_eq!(r.host(), "[::1]");
        assert!(r.is_local());
    }

    #[test]
    fn test_defaulting() {
        assert_eq!(Registry::new("", Validation::Weak).unwrap().name(), DEFAULT_REGISTRY);
        assert!(Registry::new("", Validation::Strict).is_err());
        assert_eq!(Registry::new("docker.io", Validation::Weak).unwrap().name(), DEFAULT_REGISTRY);
        assert!(Registry::new("bad host", Validation::Weak).is_err());
    }
}
