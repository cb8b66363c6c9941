//! SHA256 content hashes
//!
//! A [`Hash`] is the `sha256:<hex>` identity of a blob or manifest. Hashes
//! are always computed over the exact bytes that travel on the wire, never
//! over re-serialized structures.

pub mod canonical;
pub mod reader;

pub use reader::{HashingReader, VerifyingReader};

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The only algorithm this crate produces or accepts.
pub const SHA256: &str = "sha256";

/// sha256 of the empty byte string.
pub const EMPTY_SHA256_HEX: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    hex: String,
}

impl Hash {
    /// Build from a 64 character lowercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(RegistryError::InvalidReference(format!(
                "invalid sha256 hex: expected 64 lowercase hex characters, got {:?}",
                hex
            )));
        }
        Ok(Hash {
            hex: hex.to_string(),
        })
    }

    /// sha256 of an in-memory byte slice.
    pub fn of(data: &[u8]) -> Self {
        Hash {
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn from_hasher(hasher: Sha256) -> Self {
        Hash {
            hex: hex::encode(hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256, self.hex)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Hash {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            RegistryError::InvalidReference(format!("digest {:?} has no algorithm prefix", s))
        })?;
        if algorithm != SHA256 {
            return Err(RegistryError::InvalidReference(format!(
                "unsupported digest algorithm {:?} in {:?}",
                algorithm, s
            )));
        }
        Hash::from_hex(hex)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash a whole stream, returning the digest and the number of bytes read.
pub async fn sha256<R: AsyncRead + Unpin>(reader: R) -> Result<(Hash, u64)> {
    let mut reader = HashingReader::new(reader);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(reader.finish())
}

/// Blocking variant used for in-memory layer construction.
pub fn sha256_sync<R: std::io::Read>(mut reader: R) -> Result<(Hash, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Hash::from_hasher(hasher), total))
}
