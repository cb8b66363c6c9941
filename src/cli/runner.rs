//! Dispatch of parsed commands onto the library

use crate::cli::args::{Args, AuthCommand, Command};
use crate::config::AppConfig;
use crate::copy::{RecursiveCopier, copy};
use crate::error::{RegistryError, Result};
use crate::image::{Image, validate_image, validate_index};
use crate::logging::Logger;
use crate::reference::{Reference, Registry, Repository, Validation};
use crate::remote::{self, Options};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Credential-helper `get` output.
#[derive(Serialize)]
struct HelperCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

pub struct Runner {
    command: Command,
    options: Options,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args, cancel: CancellationToken) -> Self {
        let config = AppConfig::from_args(&args.global);
        let output = if config.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(config.verbose)
        };
        Runner {
            command: args.command,
            options: config.options(cancel),
            output,
        }
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Digest { reference } => self.digest(reference).await,
            Command::Manifest { reference } => {
                let desc = remote::get(&parse(reference)?, &self.options).await?;
                write_stdout(desc.raw_manifest()).await
            }
            Command::Config { reference } => {
                let image = remote::image(&parse(reference)?, &self.options).await?;
                write_stdout(&image.raw_config().await?).await
            }
            Command::Ls {
                repository,
                full_ref,
                omit_digest_tags,
            } => self.ls(repository, *full_ref, *omit_digest_tags).await,
            Command::Catalog { registry } => {
                let registry = Registry::new(registry, Validation::Weak)?;
                for name in remote::catalog(&registry, &self.options).await? {
                    println!("{}", name);
                }
                Ok(())
            }
            Command::Copy {
                source,
                destination,
                recursive,
            } => self.copy(source, destination, *recursive).await,
            Command::Tag { reference, tag } => {
                let reference = parse(reference)?;
                let artifact = remote::get(&reference, &self.options).await?.artifact()?;
                let tag = reference.context().tag(tag)?;
                let digest = remote::tag(&tag, &artifact, &self.options).await?;
                self.output.success(&format!("tagged {} as {}", digest, tag));
                Ok(())
            }
            Command::Delete { reference } => {
                let reference = parse(reference)?;
                remote::delete(&reference, &self.options).await?;
                self.output.success(&format!("deleted {}", reference));
                Ok(())
            }
            Command::Blob { reference } => self.blob(reference).await,
            Command::Validate { reference } => self.validate(reference).await,
            Command::Auth {
                command: AuthCommand::Get { registry },
            } => self.auth_get(registry).await,
        }
    }

    async fn digest(&self, reference: &str) -> Result<()> {
        let reference = parse(reference)?;
        let digest = if self.options.platform().is_some() {
            remote::image(&reference, &self.options).await?.digest().await?
        } else {
            remote::head(&reference, &self.options).await?.digest
        };
        println!("{}", digest);
        Ok(())
    }

    async fn ls(&self, repository: &str, full_ref: bool, omit_digest_tags: bool) -> Result<()> {
        let repository = Repository::new(repository, Validation::Weak)?;
        for tag in remote::list_tags(&repository, &self.options).await? {
            if omit_digest_tags && tag.starts_with("sha256-") {
                continue;
            }
            if full_ref {
                println!("{}:{}", repository, tag);
            } else {
                println!("{}", tag);
            }
        }
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str, recursive: bool) -> Result<()> {
        if recursive {
            let src = Repository::new(source, Validation::Weak)?;
            let dst = Repository::new(destination, Validation::Weak)?;
            self.output.section(&format!("Copying {} to {}", src, dst));
            let stats = RecursiveCopier::new(self.options.clone()).run(&src, &dst).await?;
            self.output.summary_kv(
                "Summary",
                &[
                    ("repositories", stats.repositories.to_string()),
                    ("tasks", stats.tasks.to_string()),
                    ("tags added", stats.retagged.to_string()),
                    ("blobs uploaded", stats.push.uploaded.to_string()),
                    ("blobs mounted", stats.push.mounted.to_string()),
                    ("bytes", self.output.format_size(stats.push.bytes)),
                    ("elapsed", self.output.format_duration(self.output.elapsed())),
                ],
            );
            return Ok(());
        }

        let src = parse(source)?;
        let dst = parse(destination)?;
        self.output.step(&format!("Copying {} to {}", src, dst));
        let stats = copy(&src, &dst, &self.options).await?;
        self.output.detail(&format!(
            "{} blobs present, {} mounted, {} uploaded ({})",
            stats.existing,
            stats.mounted,
            stats.uploaded,
            self.output.format_size(stats.bytes)
        ));
        self.output.success(&format!(
            "copied {} in {}",
            dst,
            self.output.format_duration(self.output.elapsed())
        ));
        Ok(())
    }

    async fn blob(&self, reference: &str) -> Result<()> {
        let Reference::Digest(digest) = parse(reference)? else {
            return Err(RegistryError::InvalidReference(format!(
                "{} must name a blob by digest",
                reference
            )));
        };
        let layer = remote::layer(&digest, &self.options).await?;
        let mut reader = crate::image::Layer::compressed(&layer).await?;
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut reader, &mut stdout).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn validate(&self, reference: &str) -> Result<()> {
        let reference = parse(reference)?;
        let desc = remote::get(&reference, &self.options).await?;
        if desc.descriptor().media_type.is_index() && self.options.platform().is_none() {
            validate_index(Arc::new(desc.index()?)).await?;
        } else {
            validate_image(&desc.image()?).await?;
        }
        self.output.success(&format!("{} is valid", reference));
        Ok(())
    }

    async fn auth_get(&self, registry: &str) -> Result<()> {
        let registry = Registry::new(registry, Validation::Weak)?;
        let auth = self.options.resolve_auth(&registry).await?.authorization();
        let credentials = if !auth.identity_token.is_empty() {
            HelperCredentials {
                username: "<token>".to_string(),
                secret: auth.identity_token,
            }
        } else {
            HelperCredentials {
                username: auth.username,
                secret: auth.password,
            }
        };
        println!("{}", serde_json::to_string(&credentials)?);
        Ok(())
    }
}

fn parse(reference: &str) -> Result<Reference> {
    Reference::parse(reference, Validation::Weak)
}

async fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(data).await?;
    stdout.flush().await?;
    Ok(())
}
