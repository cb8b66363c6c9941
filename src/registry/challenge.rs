//! `WWW-Authenticate` parsing and the `/v2/` ping

use crate::error::{RegistryError, Result};
use crate::error::handlers::response_error;
use crate::reference::Registry;
use crate::registry::transport::{RoundTripper, request, set_header};
use reqwest::header::{USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Authentication scheme advertised by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Anonymous,
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// One parsed `WWW-Authenticate` challenge: a scheme and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

impl AuthHeader {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parse `Scheme k=v, k="quoted, value"`. Quoted strings may contain commas
/// and backslash escapes.
pub fn parse_www_authenticate(header: &str) -> Option<AuthHeader> {
    let header = header.trim();
    let (scheme, rest) = match header.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme, rest),
        None => (header, ""),
    };
    if scheme.is_empty() {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.insert(key, value);
    }

    Some(AuthHeader {
        scheme: scheme.to_string(),
        params,
    })
}

/// Interpret the challenge of a 401 ping response.
pub fn parse_challenge(header: Option<&str>) -> Challenge {
    let Some(parsed) = header.and_then(parse_www_authenticate) else {
        return Challenge::Anonymous;
    };
    if parsed.scheme.eq_ignore_ascii_case("basic") {
        return Challenge::Basic;
    }
    if parsed.scheme.eq_ignore_ascii_case("bearer") {
        if let Some(realm) = parsed.param("realm") {
            return Challenge::Bearer {
                realm: realm.to_string(),
                service: parsed.param("service").map(str::to_string),
                scope: parsed.param("scope").map(str::to_string),
            };
        }
    }
    debug!(scheme = %parsed.scheme, "unrecognized auth challenge, treating as anonymous");
    Challenge::Anonymous
}

/// Outcome of a successful ping.
#[derive(Debug, Clone)]
pub struct Pinged {
    pub scheme: &'static str,
    pub challenge: Challenge,
}

/// GET `/v2/` over https, then over http when the registry allows it.
pub async fn ping(
    rt: &dyn RoundTripper,
    registry: &Registry,
    insecure: bool,
    user_agent: &str,
) -> Result<Pinged> {
    let schemes: &[&'static str] = if insecure || registry.allows_http() {
        &["https", "http"]
    } else {
        &["https"]
    };

    let mut last_error = None;
    for &scheme in schemes {
        let url = Url::parse(&format!("{}://{}/v2/", scheme, registry.name()))?;
        let mut req = request(Method::GET, url.clone());
        set_header(&mut req, USER_AGENT, user_agent);

        let response = match rt.round_trip(req).await {
            Ok(response) => response,
            Err(RegistryError::Canceled) => return Err(RegistryError::Canceled),
            Err(e) => {
                debug!(url = %url, error = %e, "ping failed");
                last_error = Some(e);
                continue;
            }
        };

        let challenge = match response.status() {
            StatusCode::OK => Challenge::Anonymous,
            StatusCode::UNAUTHORIZED => {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok());
                parse_challenge(header)
            }
            _ => return Err(response_error(response, &Method::GET, &url).await),
        };
        return Ok(Pinged { scheme, challenge });
    }

    Err(last_error.unwrap_or_else(|| {
        RegistryError::transient(format!("unable to reach registry {}", registry))
    }))
}
