//! Typed image references
//!
//! A reference names an artifact in a registry either by tag
//! (`registry/repo:tag`) or by content digest (`registry/repo@sha256:...`).
//! Every reference owns its [`Repository`], which in turn owns its
//! [`Registry`].

mod digest;
mod registry;
mod repository;
mod tag;

pub use digest::Digest;
pub use registry::{DEFAULT_REGISTRY, Registry};
pub use repository::Repository;
pub use tag::{DEFAULT_TAG, Tag};

use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use std::fmt;
use std::str::FromStr;

/// How much elision the parser tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    /// Registry, `library/` namespace and tag may be omitted and are defaulted.
    #[default]
    Weak,
    /// Every component must be spelled out.
    Strict,
}

/// Something credentials can be resolved for.
pub trait Resource: Send + Sync {
    /// Full name, e.g. `gcr.io/project/app`
    fn string(&self) -> String;
    /// Host with optional port, e.g. `gcr.io` or `localhost:5000`
    fn registry_str(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(Tag),
    Digest(Digest),
}

impl Reference {
    /// Parse `registry/repo[:tag][@sha256:hex]`.
    ///
    /// A `tag@digest` string collapses to a [`Digest`] that remembers the
    /// tag, see [`Digest::write_target`].
    pub fn parse(s: &str, validation: Validation) -> Result<Self> {
        if s.is_empty() {
            return Err(RegistryError::InvalidReference("empty reference".to_string()));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (s, None),
        };

        let (repo, tag) = split_tag(name);

        match digest {
            Some(digest) => {
                let hash = parse_digest(digest)?;
                let repository = Repository::new(repo, validation)?;
                let original_tag = tag.map(|t| Tag::new(repository.clone(), t, validation)).transpose()?;
                Ok(Reference::Digest(Digest::with_tag(
                    repository,
                    hash,
                    original_tag.map(|t| t.tag().to_string()),
                )))
            }
            None => {
                let repository = Repository::new(repo, validation)?;
                let tag = match tag {
                    Some(tag) => Tag::new(repository, tag, validation)?,
                    None if validation == Validation::Strict => {
                        return Err(RegistryError::InvalidReference(format!(
                            "strict validation requires the tag or digest to be specified in {:?}",
                            s
                        )));
                    }
                    None => Tag::new(repository, DEFAULT_TAG, validation)?,
                };
                Ok(Reference::Tag(tag))
            }
        }
    }

    pub fn context(&self) -> &Repository {
        match self {
            Reference::Tag(t) => t.repository(),
            Reference::Digest(d) => d.repository(),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.context().registry()
    }

    /// The tag or `sha256:...` string used in `/v2/<repo>/manifests/<identifier>`.
    pub fn identifier(&self) -> String {
        match self {
            Reference::Tag(t) => t.tag().to_string(),
            Reference::Digest(d) => d.hash().to_string(),
        }
    }

    pub fn digest(&self) -> Option<&Hash> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(d) => Some(d.hash()),
        }
    }

    pub fn scope(&self, action: &str) -> String {
        self.context().scope(action)
    }

    /// Same identifier, different repository.
    pub fn in_repository(&self, repository: Repository) -> Reference {
        match self {
            Reference::Tag(t) => Reference::Tag(repository.tag_unchecked(t.tag())),
            Reference::Digest(d) => Reference::Digest(repository.digest(d.hash().clone())),
        }
    }

    /// Where a write addressed by this reference should land.
    pub fn write_target(&self) -> Reference {
        match self {
            Reference::Tag(_) => self.clone(),
            Reference::Digest(d) => d.write_target(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(t) => t.fmt(f),
            Reference::Digest(d) => d.fmt(f),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s, Validation::Weak)
    }
}

impl From<Tag> for Reference {
    fn from(tag: Tag) -> Self {
        Reference::Tag(tag)
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Reference::Digest(digest)
    }
}

/// Split a trailing `:tag`, ignoring colons that belong to a registry port.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_slash = name.rfind('/');
    match name.rfind(':') {
        Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
            (&name[..colon], Some(&name[colon + 1..]))
        }
        _ => (name, None),
    }
}

fn parse_digest(s: &str) -> Result<Hash> {
    match s.split_once(':') {
        Some(("sha256", _)) => s.parse(),
        Some((algorithm, _)) => Err(RegistryError::InvalidReference(format!(
            "unsupported digest algorithm {:?}, only sha256 is accepted",
            algorithm
        ))),
        None => Err(RegistryError::InvalidReference(format!(
            "ambiguous digest {:?}: missing algorithm prefix",
            s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_tag_with_defaults() {
        let r: Reference = "ubuntu".parse().unwrap();
        assert_eq!(r.to_string(), "index.docker.io/library/ubuntu:latest");
        assert_eq!(r.registry().name(), "index.docker.io");
        assert_eq!(r.context().repository_str(), "library/ubuntu");
        assert_eq!(r.identifier(), "latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r: Reference = "localhost:5000/team/app:v1.2".parse().unwrap();
        assert_eq!(r.registry().name(), "localhost:5000");
        assert_eq!(r.context().repository_str(), "team/app");
        assert_eq!(r.identifier(), "v1.2");

        let r: Reference = "localhost:5000/app".parse().unwrap();
        assert_eq!(r.identifier(), "latest");
    }

    #[test]
    fn test_parse_digest() {
        let r: Reference = format!("example.com/lib/app@sha256:{}", HEX).parse().unwrap();
        assert!(matches!(r, Reference::Digest(_)));
        assert_eq!(r.identifier(), format!("sha256:{}", HEX));
        assert_eq!(r.write_target(), r);
    }

    #[test]
    fn test_tag_at_digest_collapses() {
        let r: Reference = format!("example.com/lib/app:v1@sha256:{}", HEX).parse().unwrap();
        assert_eq!(r.identifier(), format!("sha256:{}", HEX));
        let target = r.write_target();
        assert_eq!(target.to_string(), "example.com/lib/app:v1");
    }

    #[test]
    fn test_docker_io_is_normalized() {
        let r: Reference = "docker.io/library/busybox:1".parse().unwrap();
        assert_eq!(r.registry().name(), DEFAULT_REGISTRY);
        let r: Reference = "index.docker.io/busybox".parse().unwrap();
        assert_eq!(r.context().repository_str(), "library/busybox");
    }

    #[test]
    fn test_strict_rejects_elision() {
        assert!(Reference::parse("ubuntu:latest", Validation::Strict).is_err());
        assert!(Reference::parse("gcr.io/project/app", Validation::Strict).is_err());
        assert!(Reference::parse("index.docker.io/ubuntu:1", Validation::Strict).is_err());
        assert!(Reference::parse("gcr.io/project/app:v1", Validation::Strict).is_ok());
    }

    #[test]
    fn test_errors() {
        assert!("example.com/app:bad tag".parse::<Reference>().is_err());
        assert!("example.com/app:.hidden".parse::<Reference>().is_err());
        assert!("example.com/App".parse::<Reference>().is_err());
        assert!("example.com/".parse::<Reference>().is_err());
        assert!(format!("example.com/app@{}", HEX).parse::<Reference>().is_err());
        assert!(format!("example.com/app@sha512:{}", HEX).parse::<Reference>().is_err());
        assert!("".parse::<Reference>().is_err());
    }

    #[test]
    fn test_scope() {
        let r: Reference = "example.com/a/x:v1".parse().unwrap();
        assert_eq!(r.scope("pull"), "repository:a/x:pull");
        assert_eq!(r.scope("push,pull"), "repository:a/x:push,pull");
        assert_eq!(r.registry().scope("*"), "registry:catalog:*");
    }
}
