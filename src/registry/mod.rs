//! Registry transport stack
//!
//! Layered round-trippers for the Docker Registry HTTP API v2 / OCI
//! Distribution protocol: ping, basic credentials, bearer tokens, retry with
//! backoff. Error normalization lives in [`crate::error::handlers`].

pub mod auth;
pub mod challenge;
pub mod retry;
pub mod token_manager;
pub mod transport;

pub use auth::BasicTransport;
pub use challenge::{Challenge, parse_challenge, ping};
pub use retry::{Backoff, RetryTransport};
pub use token_manager::BearerTransport;
pub use transport::{HttpTransport, RoundTripper, Transport, TransportConfig};
