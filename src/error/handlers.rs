//! Normalization of registry HTTP responses into [`RegistryError`]
//!
//! Registries answer failures with an error document
//! `{"errors": [{"code", "message", "detail"}]}`. When the body decodes as
//! one, the diagnostics are kept; otherwise a bounded prefix of the body is
//! carried along with the status code.

use crate::error::{RegistryError, Result};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Longest body prefix kept in an error message.
const MAX_BODY_PREFIX: usize = 1024;

/// One entry of a registry error document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "; {}", detail)?;
        }
        Ok(())
    }
}

/// The `{"errors": [...]}` body returned by conforming registries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
}

/// A non-2xx response that did not map onto a more specific error kind.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: u16,
    pub method: String,
    pub url: String,
    pub errors: Vec<Diagnostic>,
    pub body: String,
}

impl HttpError {
    /// Build from a status and raw body, decoding the error document if possible.
    pub fn from_body(status: StatusCode, method: &Method, url: &Url, body: &[u8]) -> Self {
        let errors = serde_json::from_slice::<ErrorDocument>(body)
            .map(|doc| doc.errors)
            .unwrap_or_default();
        let text = String::from_utf8_lossy(body);
        let body = if text.len() > MAX_BODY_PREFIX {
            let mut end = MAX_BODY_PREFIX;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        } else {
            text.into_owned()
        };

        HttpError {
            status: status.as_u16(),
            method: method.to_string(),
            url: redact(url),
            errors,
            body,
        }
    }

    /// True when any diagnostic carries the given registry error code.
    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|d| d.code == code)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: ", self.method, self.url)?;
        if self.errors.is_empty() {
            let reason = StatusCode::from_u16(self.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("");
            write!(f, "unexpected status code {} {}", self.status, reason)?;
            if !self.body.is_empty() {
                write!(f, ": {}", self.body)?;
            }
            return Ok(());
        }
        let joined: Vec<String> = self.errors.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", joined.join("; "))
    }
}

impl std::error::Error for HttpError {}

/// Map an HTTP failure onto the error kind callers branch on.
pub fn classify(err: HttpError) -> RegistryError {
    match err.status {
        404 => RegistryError::NotFound(err.to_string()),
        401 | 403 => RegistryError::Unauthorized(err.to_string()),
        429 | 500..=599 => RegistryError::Transient {
            status: Some(err.status),
            message: err.to_string(),
        },
        _ => RegistryError::Protocol(err),
    }
}

/// Pass the response through when its status is expected, otherwise consume
/// the body and turn it into a [`RegistryError`].
pub async fn check_response(
    response: Response,
    method: &Method,
    url: &Url,
    expected: &[StatusCode],
) -> Result<Response> {
    if expected.contains(&response.status()) {
        return Ok(response);
    }
    Err(response_error(response, method, url).await)
}

/// Consume a failed response and turn it into a [`RegistryError`].
pub async fn response_error(response: Response, method: &Method, url: &Url) -> RegistryError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    classify(HttpError::from_body(status, method, url, &body))
}

/// Whether a status code should be retried by the backoff policy.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Strip query parameters that may carry upload state or credentials.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    let _ = url.set_password(None);
    if url.query().is_some() {
        url.set_query(Some("REDACTED"));
    }
    url.to_string()
}
