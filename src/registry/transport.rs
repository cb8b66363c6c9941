//! HTTP round-trippers and the composed registry transport
//!
//! Every concern (retry, basic credentials, bearer tokens) is a
//! [`RoundTripper`] wrapping another one. [`Transport::new`] pings the
//! registry once, picks the wrapper matching the advertised challenge and
//! hides the layering from callers.

use crate::error::{RegistryError, Result};
use crate::keychain::Authenticator;
use crate::reference::Registry;
use crate::registry::auth::BasicTransport;
use crate::registry::challenge::{Challenge, ping};
use crate::registry::retry::{Backoff, RetryTransport};
use crate::registry::token_manager::BearerTransport;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Request, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Sends one HTTP request and returns the raw response, whatever its status.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, request: Request) -> Result<Response>;
}

/// The bottom of every stack: a `reqwest` client that honors cancellation.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(insecure: bool, cancel: CancellationToken) -> Result<Self> {
        let client = if insecure {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            reqwest::Client::builder().build()
        }
        .map_err(|e| RegistryError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(HttpTransport { client, cancel })
    }

    pub fn with_client(client: reqwest::Client, cancel: CancellationToken) -> Self {
        HttpTransport { client, cancel }
    }
}

#[async_trait]
impl RoundTripper for HttpTransport {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RegistryError::Canceled),
            response = self.client.execute(request) => Ok(response?),
        }
    }
}

/// Settings shared by every transport built for one operation.
#[derive(Clone)]
pub struct TransportConfig {
    pub user_agent: String,
    pub backoff: Backoff,
    pub insecure: bool,
    pub cancel: CancellationToken,
}

/// An authenticated round-tripper bound to one registry and a set of scopes.
#[derive(Clone)]
pub struct Transport {
    registry: Registry,
    scheme: &'static str,
    inner: Arc<dyn RoundTripper>,
    cancel: CancellationToken,
}

impl Transport {
    /// Ping `registry`, then wrap `base` according to the challenge it sent.
    pub async fn new(
        registry: &Registry,
        auth: Authenticator,
        base: Arc<dyn RoundTripper>,
        scopes: Vec<String>,
        config: &TransportConfig,
    ) -> Result<Self> {
        let retry: Arc<dyn RoundTripper> = Arc::new(RetryTransport::new(
            base.clone(),
            config.backoff,
            &config.user_agent,
            config.cancel.clone(),
        ));

        let pinged = ping(base.as_ref(), registry, config.insecure, &config.user_agent).await?;
        debug!(registry = %registry, scheme = pinged.scheme, challenge = ?pinged.challenge, "pinged registry");

        let inner: Arc<dyn RoundTripper> = match pinged.challenge {
            Challenge::Anonymous => retry,
            Challenge::Basic => Arc::new(BasicTransport::new(retry, auth, registry.clone())),
            Challenge::Bearer { realm, service, .. } => {
                let realm = Url::parse(&realm).map_err(|e| {
                    RegistryError::Unauthorized(format!("invalid token realm {:?}: {}", realm, e))
                })?;
                Arc::new(BearerTransport::new(
                    retry,
                    auth,
                    registry.clone(),
                    realm,
                    service,
                    scopes,
                ))
            }
        };

        Ok(Transport {
            registry: registry.clone(),
            scheme: pinged.scheme,
            inner,
            cancel: config.cancel.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `<scheme>://<registry>/v2/<path>`
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}://{}/v2/{}",
            self.scheme,
            self.registry.name(),
            path
        ))?)
    }
}

#[async_trait]
impl RoundTripper for Transport {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        self.inner.round_trip(request).await
    }
}

/// Build a bodiless request.
pub fn request(method: Method, url: Url) -> Request {
    Request::new(method, url)
}

/// Build a request carrying `body`, which keeps it cloneable for retries.
pub fn request_with_body(method: Method, url: Url, body: Bytes) -> Request {
    let mut request = Request::new(method, url);
    *request.body_mut() = Some(body.into());
    request
}

/// Set a header from a string, ignoring values that are not valid header text.
pub fn set_header(request: &mut Request, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        request.headers_mut().insert(name, value);
    }
}

/// Whether `url` points at `registry`, so credentials may be attached.
pub(crate) fn matches_host(url: &Url, registry: &Registry) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    authority == registry.name() || (registry.is_default() && host == "registry-1.docker.io")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Validation;

    #[test]
    fn test_matches_host() {
        let reg = Registry::new("localhost:5000", Validation::Weak).unwrap();
        assert!(matches_host(&Url::parse("http://localhost:5000/v2/").unwrap(), &reg));
        assert!(!matches_host(&Url::parse("http://localhost/v2/").unwrap(), &reg));
        assert!(!matches_host(&Url::parse("https://storage.example.com/blob").unwrap(), &reg));

        let hub = Registry::default_registry();
        assert!(matches_host(&Url::parse("https://index.docker.io/v2/").unwrap(), &hub));
        assert!(matches_host(&Url::parse("https://registry-1.docker.io/v2/").unwrap(), &hub));
    }

    #[tokio::test]
    async fn test_canceled_transport_refuses_requests() {
        let cancel = CancellationToken::new();
        let http = HttpTransport::new(false, cancel.clone()).unwrap();
        cancel.cancel();
        let req = request(Method::GET, Url::parse("https://example.com/v2/").unwrap());
        let err = http.round_trip(req).await.unwrap_err();
        assert!(matches!(err, RegistryError::Canceled));
    }
}
