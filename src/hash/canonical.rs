//! Canonical JSON encoding for manifests and configs
//!
//! Documents are serialized compactly in schema field order (the order the
//! fields are declared on the struct) with no trailing newline, so a
//! document built in memory always hashes to the same digest.

use crate::error::Result;
use crate::hash::Hash;
use serde::Serialize;

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Canonical bytes together with their digest.
pub fn encode<T: Serialize>(value: &T) -> Result<(Vec<u8>, Hash)> {
    let bytes = to_vec(value)?;
    let hash = Hash::of(&bytes);
    Ok((bytes, hash))
}
