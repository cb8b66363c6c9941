use crate::hash::Hash;
use crate::reference::{Reference, Repository};
use std::fmt;

/// A content-addressed reference, `repo@sha256:...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    repository: Repository,
    hash: Hash,
    original_tag: Option<String>,
}

impl Digest {
    pub fn new(repository: Repository, hash: Hash) -> Self {
        Self::with_tag(repository, hash, None)
    }

    pub(crate) fn with_tag(repository: Repository, hash: Hash, original_tag: Option<String>) -> Self {
        Digest {
            repository,
            hash,
            original_tag,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Tag from a `tag@digest` source string, if any.
    pub fn original_tag(&self) -> Option<&str> {
        self.original_tag.as_deref()
    }

    /// Writes go to the tag when one was given alongside the digest.
    pub fn write_target(&self) -> Reference {
        match &self.original_tag {
            Some(tag) => Reference::Tag(self.repository.tag_unchecked(tag)),
            None => Reference::Digest(Digest::new(self.repository.clone(), self.hash.clone())),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.hash)
    }
}
