//! `docker-credential-<name>` helper protocol

use crate::error::{RegistryError, Result};
use crate::keychain::AuthConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Message helpers print when they hold nothing for the server.
const NOT_FOUND_MESSAGE: &str = "credentials not found in native keychain";

/// Username helpers return when the secret is an identity token.
const TOKEN_USERNAME: &str = "<token>";

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

#[derive(Debug, Clone)]
pub struct CredentialHelper {
    name: String,
    search_dir: Option<PathBuf>,
}

impl CredentialHelper {
    pub fn new(name: &str) -> Self {
        CredentialHelper {
            name: name.to_string(),
            search_dir: None,
        }
    }

    /// Look for the binary in `dir` instead of `PATH`.
    pub fn in_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.search_dir = dir;
        self
    }

    fn program(&self) -> PathBuf {
        let binary = format!("docker-credential-{}", self.name);
        match &self.search_dir {
            Some(dir) => dir.join(binary),
            None => PathBuf::from(binary),
        }
    }

    /// Run `<helper> get` for `server_url`. `None` means the helper has no
    /// credentials for it.
    pub async fn get(&self, server_url: &str) -> Result<Option<AuthConfig>> {
        let program = self.program();
        debug!(helper = %program.display(), server = server_url, "invoking credential helper");

        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RegistryError::CredentialHelper(format!(
                    "failed to run {}: {}",
                    program.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(server_url.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let not_found = |text: &str| text.trim().to_ascii_lowercase().contains(NOT_FOUND_MESSAGE);
        if not_found(&stdout) || not_found(&stderr) {
            debug!(server = server_url, "credential helper has no entry");
            return Ok(None);
        }
        if !output.status.success() {
            return Err(RegistryError::CredentialHelper(format!(
                "{} get exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let response: HelperResponse = serde_json::from_str(stdout.trim()).map_err(|e| {
            RegistryError::CredentialHelper(format!(
                "unparseable output from {}: {}",
                program.display(),
                e
            ))
        })?;
        if response.username == TOKEN_USERNAME {
            return Ok(Some(AuthConfig {
                identity_token: response.secret,
                ..Default::default()
            }));
        }
        Ok(Some(AuthConfig::basic(&response.username, &response.secret)))
    }
}
