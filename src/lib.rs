//! OCI Distribution client library
//!
//! Reads and writes images in registries that speak the OCI Distribution /
//! Docker Registry v2 protocol: typed references, credential keychains, a
//! layered authenticating transport, lazily fetched and digest-verified
//! images, chunked pushes with cross-repository mounts, tag listing and a
//! recursive repository copier.

pub mod cache;
pub mod cli;
pub mod config;
pub mod copy;
pub mod error;
pub mod hash;
pub mod image;
pub mod keychain;
pub mod logging;
pub mod reference;
pub mod registry;
pub mod remote;

pub use error::{RegistryError, Result};
pub use hash::Hash;
pub use reference::{Reference, Repository, Registry};
