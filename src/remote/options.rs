//! Settings shared by every remote operation

use crate::cache::BlobCache;
use crate::error::Result;
use crate::image::Platform;
use crate::keychain::{Authenticator, Keychain, default_keychain};
use crate::reference::{Registry, Repository, Resource};
use crate::registry::{Backoff, HttpTransport, RoundTripper, Transport, TransportConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bytes sent per upload PATCH.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

pub const USER_AGENT: &str = concat!("oci-crane/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
enum AuthSource {
    Keychain(Arc<dyn Keychain>),
    Fixed(Authenticator),
}

/// Builder-style configuration for [`crate::remote`] calls.
#[derive(Clone)]
pub struct Options {
    auth: AuthSource,
    platform: Option<Platform>,
    jobs: usize,
    chunk_size: usize,
    user_agent: Option<String>,
    insecure: bool,
    backoff: Backoff,
    cache: Option<Arc<dyn BlobCache>>,
    mount: Vec<Repository>,
    page_size: Option<usize>,
    cancel: CancellationToken,
    transport: Option<Arc<dyn RoundTripper>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            auth: AuthSource::Keychain(default_keychain()),
            platform: None,
            jobs: default_jobs(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            user_agent: None,
            insecure: false,
            backoff: Backoff::transport_default(),
            cache: None,
            mount: Vec::new(),
            page_size: None,
            cancel: CancellationToken::new(),
            transport: None,
        }
    }
}

/// One job per processor.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keychain(mut self, keychain: Arc<dyn Keychain>) -> Self {
        self.auth = AuthSource::Keychain(keychain);
        self
    }

    /// Use these credentials for every registry instead of a keychain.
    pub fn with_auth(mut self, auth: Authenticator) -> Self {
        self.auth = AuthSource::Fixed(auth);
        self
    }

    /// Child image to pick when a reference resolves to an index.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Bound on concurrent blob uploads per image.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Prefix for the `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    /// Allow plain http and skip TLS verification.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Retry policy for individual requests.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn BlobCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Extra repositories on the destination registry to mount blobs from.
    pub fn with_mount(mut self, repositories: Vec<Repository>) -> Self {
        self.mount = repositories;
        self
    }

    /// `n` parameter for paginated listings.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the HTTP client at the bottom of every transport stack.
    pub fn with_transport(mut self, transport: Arc<dyn RoundTripper>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    pub fn cache(&self) -> Option<&Arc<dyn BlobCache>> {
        self.cache.as_ref()
    }

    pub fn mount(&self) -> &[Repository] {
        &self.mount
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn user_agent(&self) -> String {
        match &self.user_agent {
            Some(prefix) => format!("{} {}", prefix, USER_AGENT),
            None => USER_AGENT.to_string(),
        }
    }

    pub async fn resolve_auth(&self, target: &dyn Resource) -> Result<Authenticator> {
        match &self.auth {
            AuthSource::Keychain(keychain) => keychain.resolve(target).await,
            AuthSource::Fixed(auth) => Ok(auth.clone()),
        }
    }

    /// Build an authenticated transport for `scopes` against `registry`,
    /// resolving credentials for `target`.
    pub async fn transport(
        &self,
        target: &dyn Resource,
        registry: &Registry,
        scopes: Vec<String>,
    ) -> Result<Transport> {
        let auth = self.resolve_auth(target).await?;
        let base: Arc<dyn RoundTripper> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(self.insecure, self.cancel.clone())?),
        };
        let config = TransportConfig {
            user_agent: self.user_agent(),
            backoff: self.backoff,
            insecure: self.insecure,
            cancel: self.cancel.clone(),
        };
        Transport::new(registry, auth, base, scopes, &config).await
    }

    /// Transport scoped to `action` on `repository`.
    pub async fn repository_transport(
        &self,
        repository: &Repository,
        action: &str,
    ) -> Result<Transport> {
        self.transport(repository, repository.registry(), vec![repository.scope(action)])
            .await
    }
}
