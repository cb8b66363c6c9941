//! Application settings for the `crane` binary and their mapping onto
//! [`Options`]

use crate::cache::FilesystemCache;
use crate::cli::args::GlobalArgs;
use crate::image::Platform;
use crate::remote::{DEFAULT_CHUNK_SIZE, Options};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub insecure: bool,
    pub jobs: Option<usize>,
    pub platform: Option<Platform>,
    pub chunk_size: usize,
    pub cache_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            insecure: false,
            jobs: None,
            platform: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_dir: None,
            user_agent: None,
            verbose: false,
            quiet: false,
        }
    }
}

impl AppConfig {
    pub fn from_args(args: &GlobalArgs) -> Self {
        AppConfig {
            insecure: args.insecure,
            jobs: args.jobs,
            platform: args.platform.clone(),
            chunk_size: args.chunk_size,
            cache_dir: args.cache_dir.clone(),
            user_agent: args.user_agent.clone(),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Library options for these settings, canceled through `cancel`.
    pub fn options(&self, cancel: CancellationToken) -> Options {
        let mut options = Options::new()
            .with_insecure(self.insecure)
            .with_chunk_size(self.chunk_size)
            .with_cancel(cancel);
        if let Some(jobs) = self.jobs {
            options = options.with_jobs(jobs);
        }
        if let Some(platform) = &self.platform {
            options = options.with_platform(platform.clone());
        }
        if let Some(dir) = &self.cache_dir {
            options = options.with_cache(Arc::new(FilesystemCache::new(dir)));
        }
        if let Some(user_agent) = &self.user_agent {
            options = options.with_user_agent(user_agent);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_mapping() {
        let config = AppConfig {
            insecure: true,
            jobs: Some(2),
            platform: Some(Platform::new("linux", "arm64")),
            chunk_size: 1024,
            user_agent: Some("ci".to_string()),
            ..AppConfig::default()
        };
        let options = config.options(CancellationToken::new());
        assert!(options.is_insecure());
        assert_eq!(options.jobs(), 2);
        assert_eq!(options.chunk_size(), 1024);
        assert_eq!(options.platform().unwrap().architecture, "arm64");
        assert!(options.cache().is_none());
        assert!(options.user_agent().starts_with("ci "));
    }
}
