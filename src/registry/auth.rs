//! Static credentials for registries that answer with a Basic challenge

use crate::error::Result;
use crate::keychain::{AuthConfig, Authenticator};
use crate::reference::Registry;
use crate::registry::transport::{RoundTripper, matches_host};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Request, Response};
use std::sync::Arc;

/// `Authorization` header value for a set of credentials, if any apply.
pub fn authorization_header(config: &AuthConfig) -> Option<HeaderValue> {
    let value = if !config.registry_token.is_empty() {
        format!("Bearer {}", config.registry_token)
    } else if !config.username.is_empty() || !config.password.is_empty() {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", config.username, config.password))
        )
    } else {
        return None;
    };
    let mut value = HeaderValue::from_str(&value).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// Adds credentials to every request bound for the registry host.
pub struct BasicTransport {
    inner: Arc<dyn RoundTripper>,
    auth: Authenticator,
    registry: Registry,
}

impl BasicTransport {
    pub fn new(inner: Arc<dyn RoundTripper>, auth: Authenticator, registry: Registry) -> Self {
        BasicTransport {
            inner,
            auth,
            registry,
        }
    }
}

#[async_trait]
impl RoundTripper for BasicTransport {
    async fn round_trip(&self, mut request: Request) -> Result<Response> {
        // Upload locations and blob redirects may point at other hosts.
        if matches_host(request.url(), &self.registry)
            && !request.headers().contains_key(AUTHORIZATION)
        {
            if let Some(value) = authorization_header(&self.auth.authorization()) {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }
        self.inner.round_trip(request).await
    }
}
