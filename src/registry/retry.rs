//! Exponential backoff and the retrying round-tripper

use crate::error::handlers::is_retryable_status;
use crate::error::{RegistryError, Result};
use crate::registry::transport::RoundTripper;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `duration * factor^attempt`, jittered by `±jitter` and optionally capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Option<Duration>,
}

impl Backoff {
    /// Per-request policy of the transport: ~1s, ~3s, ~9s.
    pub fn transport_default() -> Self {
        Backoff {
            duration: Duration::from_secs(1),
            factor: 3.0,
            jitter: 0.1,
            steps: 3,
            cap: None,
        }
    }

    /// Per-task policy of the recursive copier, tuned for rate-limited
    /// registries: ~6s, ~60s, ~10m, never more than an hour.
    pub fn copier_default() -> Self {
        Backoff {
            duration: Duration::from_secs(6),
            factor: 10.0,
            jitter: 0.1,
            steps: 3,
            cap: Some(Duration::from_secs(3600)),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Backoff {
            duration: Duration::ZERO,
            factor: 1.0,
            jitter: 0.0,
            steps: 0,
            cap: None,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.duration.as_secs_f64() * self.factor.powi(attempt as i32);
        let spread = if self.jitter > 0.0 {
            1.0 + self.jitter * (2.0 * rand::random::<f64>() - 1.0)
        } else {
            1.0
        };
        let delay = Duration::from_secs_f64((base * spread).max(0.0));
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Sleep unless canceled first.
pub async fn sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RegistryError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Upload PATCHes carry a `Content-Range`, so replaying one rewrites the same
/// bytes. A bodiless POST only opens an upload session or asks for a mount.
fn is_replayable(request: &Request) -> bool {
    match *request.method() {
        Method::GET | Method::HEAD | Method::PUT | Method::PATCH | Method::DELETE | Method::OPTIONS => {
            true
        }
        Method::POST => request
            .body()
            .is_none_or(|body| body.as_bytes().is_some_and(|bytes| bytes.is_empty())),
        _ => false,
    }
}

/// Sets the user agent and retries replayable requests on network errors,
/// 429 and 5xx.
pub struct RetryTransport {
    inner: Arc<dyn RoundTripper>,
    backoff: Backoff,
    user_agent: Option<HeaderValue>,
    cancel: CancellationToken,
}

impl RetryTransport {
    pub fn new(
        inner: Arc<dyn RoundTripper>,
        backoff: Backoff,
        user_agent: &str,
        cancel: CancellationToken,
    ) -> Self {
        RetryTransport {
            inner,
            backoff,
            user_agent: HeaderValue::from_str(user_agent).ok(),
            cancel,
        }
    }
}

#[async_trait]
impl RoundTripper for RetryTransport {
    async fn round_trip(&self, mut request: Request) -> Result<Response> {
        if let Some(ua) = &self.user_agent {
            request.headers_mut().entry(USER_AGENT).or_insert_with(|| ua.clone());
        }
        if !is_replayable(&request) {
            return self.inner.round_trip(request).await;
        }

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RegistryError::Canceled);
            }
            // Streaming bodies cannot be replayed; send them once.
            let Some(replay) = request.try_clone() else {
                return self.inner.round_trip(request).await;
            };
            let outcome = self.inner.round_trip(replay).await;
            let retry = match &outcome {
                Ok(response) => is_retryable_status(response.status()),
                Err(e) => e.is_retryable(),
            };
            if !retry || attempt >= self.backoff.steps {
                return outcome;
            }

            let delay = self.backoff.delay(attempt);
            match &outcome {
                Ok(response) => {
                    warn!(url = %request.url(), status = %response.status(), ?delay, "retrying request")
                }
                Err(e) => warn!(url = %request.url(), error = %e, ?delay, "retrying request"),
            }
            sleep(delay, &self.cancel).await?;
            attempt += 1;
        }
    }
}
