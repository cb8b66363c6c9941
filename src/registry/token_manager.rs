//! Bearer token acquisition and refresh
//!
//! The token is fetched lazily on the first request, cached with its
//! expiry and refreshed once when the registry answers 401 (or 403 with an
//! `insufficient_scope` challenge). Refreshes are serialized by one lock;
//! callers that raced into a refresh reuse the token the winner fetched.

use crate::error::handlers::check_response;
use crate::error::{RegistryError, Result};
use crate::keychain::{AuthConfig, Authenticator};
use crate::reference::Registry;
use crate::registry::auth::authorization_header;
use crate::registry::challenge::parse_www_authenticate;
use crate::registry::transport::{RoundTripper, matches_host, request, request_with_body};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 60;

/// `client_id` sent with OAuth2 refresh-token grants.
const CLIENT_ID: &str = "oci-crane";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

#[derive(Clone)]
struct Token {
    value: String,
    expires_at: Instant,
}

impl Token {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct TokenState {
    token: Option<Token>,
    generation: u64,
    scopes: Vec<String>,
}

pub struct BearerTransport {
    inner: Arc<dyn RoundTripper>,
    auth: Authenticator,
    registry: Registry,
    realm: Url,
    service: Option<String>,
    state: Mutex<TokenState>,
}

impl BearerTransport {
    pub fn new(
        inner: Arc<dyn RoundTripper>,
        auth: Authenticator,
        registry: Registry,
        realm: Url,
        service: Option<String>,
        scopes: Vec<String>,
    ) -> Self {
        BearerTransport {
            inner,
            auth,
            registry,
            realm,
            service,
            state: Mutex::new(TokenState {
                token: None,
                generation: 0,
                scopes,
            }),
        }
    }

    /// Current token and the generation it belongs to, fetching one if needed.
    async fn token(&self) -> Result<(String, u64)> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.token.as_ref().filter(|t| !t.is_expired()) {
            return Ok((token.value.clone(), state.generation));
        }
        let value = self.refresh_locked(&mut state).await?;
        Ok((value, state.generation))
    }

    /// Replace the token seen at `seen_generation`. When another caller
    /// already replaced it, its token is reused.
    async fn refresh(&self, seen_generation: u64, extra_scope: Option<String>) -> Result<String> {
        let mut state = self.state.lock().await;
        let mut widened = false;
        if let Some(scope) = extra_scope {
            if !state.scopes.contains(&scope) {
                state.scopes.push(scope);
                widened = true;
            }
        }
        if !widened && state.generation != seen_generation {
            if let Some(token) = &state.token {
                return Ok(token.value.clone());
            }
        }
        self.refresh_locked(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String> {
        let token = self.fetch_token(&state.scopes).await?;
        let value = token.value.clone();
        state.token = Some(token);
        state.generation += 1;
        Ok(value)
    }

    async fn fetch_token(&self, scopes: &[String]) -> Result<Token> {
        let config = self.auth.authorization();
        if !config.registry_token.is_empty() {
            return Ok(Token {
                value: config.registry_token,
                expires_at: Instant::now() + Duration::from_secs(24 * 3600),
            });
        }
        debug!(realm = %self.realm, ?scopes, "requesting bearer token");
        let response = if config.identity_token.is_empty() {
            self.fetch_with_basic(&config, scopes).await?
        } else {
            self.fetch_with_refresh_token(&config, scopes).await?
        };
        parse_token(response).await
    }

    async fn fetch_with_basic(&self, config: &AuthConfig, scopes: &[String]) -> Result<Response> {
        let mut url = self.realm.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &self.service {
                query.append_pair("service", service);
            }
            for scope in scopes {
                query.append_pair("scope", scope);
            }
        }
        let mut req = request(Method::GET, url.clone());
        if let Some(value) = authorization_header(config) {
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        let response = self.inner.round_trip(req).await?;
        check_response(response, &Method::GET, &url, &[StatusCode::OK])
            .await
            .map_err(token_error)
    }

    async fn fetch_with_refresh_token(
        &self,
        config: &AuthConfig,
        scopes: &[String],
    ) -> Result<Response> {
        // The serializer is not Send; finish it before any await.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", &config.identity_token)
                .append_pair("client_id", CLIENT_ID)
                .append_pair("scope", &scopes.join(" "));
            if let Some(service) = &self.service {
                form.append_pair("service", service);
            }
            form.finish()
        };
        let mut req = request_with_body(Method::POST, self.realm.clone(), Bytes::from(body));
        req.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let response = self.inner.round_trip(req).await?;
        check_response(response, &Method::POST, &self.realm, &[StatusCode::OK])
            .await
            .map_err(token_error)
    }

    async fn send(&self, mut request: Request, token: &str) -> Result<Response> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            RegistryError::Unauthorized("token endpoint returned an unusable token".to_string())
        })?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        self.inner.round_trip(request).await
    }
}

#[async_trait]
impl RoundTripper for BearerTransport {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        if !matches_host(request.url(), &self.registry) {
            return self.inner.round_trip(request).await;
        }

        let replay = request.try_clone();
        let (token, generation) = self.token().await?;
        let response = self.send(request, &token).await?;

        let extra_scope = match response.status() {
            StatusCode::UNAUTHORIZED => Some(None),
            StatusCode::FORBIDDEN => insufficient_scope(&response).map(Some),
            _ => None,
        };
        let (Some(extra_scope), Some(replay)) = (extra_scope, replay) else {
            return Ok(response);
        };

        warn!(
            url = %replay.url(),
            status = %response.status(),
            "refreshing bearer token and retrying once"
        );
        let token = self.refresh(generation, extra_scope).await?;
        self.send(replay, &token).await
    }
}

/// Scope named by a 403 `insufficient_scope` challenge.
fn insufficient_scope(response: &Response) -> Option<String> {
    let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let parsed = parse_www_authenticate(header)?;
    if parsed.param("error") != Some("insufficient_scope") {
        return None;
    }
    parsed.param("scope").map(str::to_string)
}

async fn parse_token(response: Response) -> Result<Token> {
    let body = response.bytes().await?;
    let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
        RegistryError::Unauthorized(format!("failed to parse token response: {}", e))
    })?;
    let value = parsed
        .token
        .filter(|t| !t.is_empty())
        .or(parsed.access_token.filter(|t| !t.is_empty()))
        .ok_or_else(|| {
            RegistryError::Unauthorized("token response carried no token".to_string())
        })?;
    let expires_in = parsed.expires_in.filter(|s| *s > 0).unwrap_or(DEFAULT_EXPIRES_IN);
    debug!(expires_in, issued_at = parsed.issued_at.as_deref(), "obtained bearer token");
    // Renew a little before the server-side expiry.
    let lifetime = Duration::from_secs(expires_in).mul_f64(0.9);
    Ok(Token {
        value,
        expires_at: Instant::now() + lifetime,
    })
}

/// Token endpoints reject bad credentials with 400 as often as with 401.
fn token_error(err: RegistryError) -> RegistryError {
    match err {
        RegistryError::Protocol(http) if http.status == 400 => {
            RegistryError::Unauthorized(http.to_string())
        }
        other => other,
    }
}
