//! Command-line argument parsing

use crate::image::Platform;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crane")]
#[command(about = "Inspect and copy images in OCI and Docker registries")]
#[command(version)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct GlobalArgs {
    /// Allow plain http and skip TLS verification
    #[arg(long, global = true, env = "CRANE_INSECURE")]
    pub insecure: bool,

    /// Number of concurrent blob transfers and copy workers
    #[arg(long, short = 'j', global = true, env = "CRANE_JOBS")]
    pub jobs: Option<usize>,

    /// Platform to pick from an index, e.g. linux/arm64/v8
    #[arg(long, global = true, env = "CRANE_PLATFORM")]
    pub platform: Option<Platform>,

    /// Bytes per upload PATCH
    #[arg(long, global = true, default_value = "10485760")]
    pub chunk_size: usize,

    /// Directory used to cache blobs and digest-addressed manifests
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Prefix for the User-Agent header
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Only print command output and errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the digest of an image or index
    Digest {
        reference: String,
    },
    /// Print the manifest exactly as the registry stores it
    Manifest {
        reference: String,
    },
    /// Print the config blob of an image
    Config {
        reference: String,
    },
    /// List the tags of a repository
    Ls {
        repository: String,
        /// Print `repository:tag` instead of the bare tag
        #[arg(long)]
        full_ref: bool,
        /// Skip `sha256-...` tags written by signing tools
        #[arg(long)]
        omit_digest_tags: bool,
    },
    /// List the repositories of a registry
    Catalog {
        registry: String,
    },
    /// Copy an image, index or repository tree
    #[command(alias = "cp")]
    Copy {
        source: String,
        destination: String,
        /// Copy every tag of the source repository and its children
        #[arg(long, short = 'r')]
        recursive: bool,
    },
    /// Add a tag to an image or index in the same repository
    Tag {
        reference: String,
        tag: String,
    },
    /// Delete a manifest
    Delete {
        reference: String,
    },
    /// Write a blob to stdout
    Blob {
        /// `repository@sha256:...`
        reference: String,
    },
    /// Check every digest, size and diff id of an image or index
    Validate {
        reference: String,
    },
    /// Credential operations
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Print the credentials resolved for a registry, in credential-helper format
    Get {
        registry: String,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy_recursive() {
        let args = Args::try_parse_from([
            "crane", "copy", "-r", "gcr.io/p/src", "r.example/dst", "--jobs", "3",
        ])
        .unwrap();
        assert_eq!(args.global.jobs, Some(3));
        match args.command {
            Command::Copy {
                source,
                destination,
                recursive,
            } => {
                assert_eq!(source, "gcr.io/p/src");
                assert_eq!(destination, "r.example/dst");
                assert!(recursive);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_platform() {
        let args = Args::try_parse_from(["crane", "digest", "alpine", "--platform", "linux/arm64/v8"]).unwrap();
        let platform = args.global.platform.unwrap();
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant.as_deref(), Some("v8"));
    }

    #[test]
    fn test_parse_auth_get() {
        let args = Args::try_parse_from(["crane", "auth", "get", "ghcr.io"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Auth {
                command: AuthCommand::Get { ref registry }
            } if registry == "ghcr.io"
        ));
    }
}
