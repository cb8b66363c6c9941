use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::reference::{Digest, Registry, Resource, Tag, Validation};
use std::fmt;

/// Namespace applied to single-component names on Docker Hub.
const LIBRARY_NAMESPACE: &str = "library";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repository {
    registry: Registry,
    repository: String,
}

impl Repository {
    /// Parse `[registry/]path`.
    pub fn new(name: &str, validation: Validation) -> Result<Self> {
        let (registry, path) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (first, rest),
            _ => ("", name),
        };
        let registry = Registry::new(registry, validation)?;
        Self::in_registry(registry, path, validation)
    }

    pub fn in_registry(registry: Registry, path: &str, validation: Validation) -> Result<Self> {
        if path.is_empty() {
            return Err(RegistryError::InvalidReference(
                "repository name must not be empty".to_string(),
            ));
        }
        check_path(path)?;

        let repository = if registry.is_default() && !path.contains('/') {
            if validation == Validation::Strict {
                return Err(RegistryError::InvalidReference(format!(
                    "strict validation requires the full repository path, got {:?}",
                    path
                )));
            }
            format!("{}/{}", LIBRARY_NAMESPACE, path)
        } else {
            path.to_string()
        };

        Ok(Repository {
            registry,
            repository,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Path within the registry, e.g. `library/ubuntu`.
    pub fn repository_str(&self) -> &str {
        &self.repository
    }

    /// `registry/path`
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Token-endpoint scope, e.g. `repository:library/ubuntu:pull`.
    pub fn scope(&self, action: &str) -> String {
        format!("repository:{}:{}", self.repository, action)
    }

    pub fn tag(&self, tag: &str) -> Result<Tag> {
        Tag::new(self.clone(), tag, Validation::Weak)
    }

    pub(crate) fn tag_unchecked(&self, tag: &str) -> Tag {
        Tag::unchecked(self.clone(), tag)
    }

    pub fn digest(&self, hash: Hash) -> Digest {
        Digest::new(self.clone(), hash)
    }

    /// A child repository, e.g. `a` + `b` = `a/b`.
    pub fn child(&self, name: &str) -> Result<Repository> {
        Self::in_registry(
            self.registry.clone(),
            &format!("{}/{}", self.repository, name),
            Validation::Weak,
        )
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.registry = self.registry.with_insecure(insecure);
        self
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

impl Resource for Repository {
    fn string(&self) -> String {
        self.name()
    }

    fn registry_str(&self) -> String {
        self.registry.name().to_string()
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn check_path(path: &str) -> Result<()> {
    for component in path.split('/') {
        let starts_ok = component
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let chars_ok = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !starts_ok || !chars_ok {
            return Err(RegistryError::InvalidReference(format!(
                "repository {:?} must be lowercase alphanumeric components separated by '/'",
                path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_and_name() {
        let repo = Repository::new("gcr.io/project", Validation::Weak).unwrap();
        let child = repo.child("nested").unwrap();
        assert_eq!(child.name(), "gcr.io/project/nested");
        assert_eq!(child.registry_str(), "gcr.io");
    }

    #[test]
    fn test_rejects_empty_components() {
        assert!(Repository::new("gcr.io/a//b", Validation::Weak).is_err());
        assert!(Repository::new("gcr.io/-a", Validation::Weak).is_err());
    }
}
