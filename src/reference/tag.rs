use crate::error::{RegistryError, Result};
use crate::reference::{Repository, Validation};
use std::fmt;

pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    repository: Repository,
    tag: String,
}

impl Tag {
    pub fn new(repository: Repository, tag: &str, validation: Validation) -> Result<Self> {
        if tag.is_empty() {
            if validation == Validation::Strict {
                return Err(RegistryError::InvalidReference(
                    "strict validation requires the tag to be explicitly specified".to_string(),
                ));
            }
            return Ok(Self::unchecked(repository, DEFAULT_TAG));
        }
        check_tag(tag)?;
        Ok(Self::unchecked(repository, tag))
    }

    pub(crate) fn unchecked(repository: Repository, tag: &str) -> Self {
        Tag {
            repository,
            tag: tag.to_string(),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn check_tag(tag: &str) -> Result<()> {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();
    let first_ok = chars.next().is_some_and(word);
    let rest_ok = chars.all(|c| word(c) || c == '.' || c == '-');
    if !first_ok || !rest_ok || tag.len() > MAX_TAG_LEN {
        return Err(RegistryError::InvalidReference(format!(
            "tag {:?} must match [A-Za-z0-9_][A-Za-z0-9_.-]{{0,127}}",
            tag
        )));
    }
    Ok(())
}
