//! Blob uploads: cross-repository mounts and chunked PATCH sessions

use crate::error::handlers::{HttpError, check_response, response_error};
use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::{BlobReader, Layer};
use crate::reference::Repository;
use crate::registry::Transport;
use crate::registry::transport::{RoundTripper, request, request_with_body, set_header};
use bytes::{Bytes, BytesMut};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderMap, LOCATION, RANGE};
use reqwest::{Method, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use url::Url;

/// Times one blob upload may restart after a 416 before giving up.
const MAX_RESUMES: u32 = 8;

/// How a blob ended up in the destination repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOutcome {
    /// HEAD found it already present
    Existing,
    /// Mounted from another repository without transferring bytes
    Mounted,
    /// Streamed through an upload session
    Uploaded { bytes: u64 },
}

enum Mount {
    Done,
    Refused(Option<Url>),
}

pub(crate) struct BlobUploader<'a> {
    repository: &'a Repository,
    transport: &'a Transport,
    chunk_size: usize,
}

impl<'a> BlobUploader<'a> {
    pub(crate) fn new(repository: &'a Repository, transport: &'a Transport, chunk_size: usize) -> Self {
        BlobUploader {
            repository,
            transport,
            chunk_size,
        }
    }

    fn uploads_url(&self) -> Result<Url> {
        self.transport
            .url(&format!("{}/blobs/uploads/", self.repository.repository_str()))
    }

    /// Try each mount source in turn, then fall back to a chunked upload.
    pub(crate) async fn upload(&self, layer: &dyn Layer, sources: &[Repository]) -> Result<BlobOutcome> {
        let digest = layer.digest();
        let mut location: Option<Url> = None;
        for source in sources {
            match self.mount(digest, source).await? {
                Mount::Done => {
                    if let Some(session) = location {
                        self.abandon(session).await;
                    }
                    info!(blob = %digest, from = %source, to = %self.repository, "mounted blob");
                    return Ok(BlobOutcome::Mounted);
                }
                // Keep the first session the registry opened; close the rest.
                Mount::Refused(Some(url)) if location.is_some() => self.abandon(url).await,
                Mount::Refused(url) => location = location.or(url),
            }
        }

        let location = match location {
            Some(url) => url,
            None => self.start().await?,
        };
        let (location, bytes) = self.stream(layer, location).await?;
        self.commit(location, digest).await?;
        info!(blob = %digest, bytes, repository = %self.repository, "uploaded blob");
        Ok(BlobOutcome::Uploaded { bytes })
    }

    async fn mount(&self, digest: &Hash, source: &Repository) -> Result<Mount> {
        let mut url = self.uploads_url()?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", source.repository_str());
        let response = self.transport.round_trip(request(Method::POST, url.clone())).await?;
        match response.status() {
            StatusCode::CREATED => Ok(Mount::Done),
            StatusCode::ACCEPTED => {
                let location = match response.headers().get(LOCATION) {
                    Some(value) => Some(url.join(value.to_str()?)?),
                    None => None,
                };
                Ok(Mount::Refused(location))
            }
            _ => Err(response_error(response, &Method::POST, &url).await),
        }
    }

    /// Cancel an upload session that will not be used. Registries expire
    /// stale sessions anyway, so failures are only logged.
    async fn abandon(&self, location: Url) {
        let outcome = self
            .transport
            .round_trip(request(Method::DELETE, location.clone()))
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                debug!(session = %location.path(), "closed unused upload session")
            }
            Ok(response) => {
                debug!(session = %location.path(), status = %response.status(), "could not close upload session")
            }
            Err(e) => debug!(session = %location.path(), error = %e, "could not close upload session"),
        }
    }

    /// Open an upload session and return its location.
    async fn start(&self) -> Result<Url> {
        let url = self.uploads_url()?;
        let response = self.transport.round_trip(request(Method::POST, url.clone())).await?;
        let response = check_response(response, &Method::POST, &url, &[StatusCode::ACCEPTED]).await?;
        require_location(&url, &response)
    }

    /// PATCH the blob in chunks, restarting from the server's offset on 416.
    async fn stream(&self, layer: &dyn Layer, mut location: Url) -> Result<(Url, u64)> {
        let mut reader = layer.compressed().await?;
        let mut offset = 0u64;
        let mut resumes = 0;
        loop {
            let chunk = read_chunk(&mut reader, self.chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            let end = offset + chunk.len() as u64 - 1;
            let mut req = request_with_body(Method::PATCH, location.clone(), chunk.clone());
            set_header(&mut req, CONTENT_TYPE, "application/octet-stream");
            set_header(&mut req, CONTENT_RANGE, &format!("{}-{}", offset, end));

            let response = self.transport.round_trip(req).await?;
            match response.status() {
                StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::CREATED => {
                    location = next_location(&location, response.headers())?;
                    offset = end + 1;
                    debug!(blob = %layer.digest(), offset, "chunk accepted");
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    resumes += 1;
                    if resumes > MAX_RESUMES {
                        return Err(response_error(response, &Method::PATCH, &location).await);
                    }
                    let committed = committed_offset(response.headers()).unwrap_or(0);
                    location = next_location(&location, response.headers())?;
                    warn!(blob = %layer.digest(), sent = offset, committed, "upload range rejected, resuming");
                    reader = layer.compressed_from(committed).await?;
                    offset = committed;
                }
                _ => return Err(response_error(response, &Method::PATCH, &location).await),
            }
        }
        Ok((location, offset))
    }

    /// Finish the session with `PUT <location>?digest=<digest>`.
    async fn commit(&self, mut location: Url, digest: &Hash) -> Result<()> {
        location
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        let response = self
            .transport
            .round_trip(request_with_body(Method::PUT, location.clone(), Bytes::new()))
            .await?;
        check_response(
            response,
            &Method::PUT,
            &location,
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }
}

/// Fill a buffer up to `size` bytes. Empty means end of stream.
async fn read_chunk(reader: &mut BlobReader, size: usize) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(size.min(1 << 20));
    let mut limited = reader.take(size as u64);
    while limited.read_buf(&mut buf).await? > 0 {}
    Ok(buf.freeze())
}

/// `Location` resolved against the request URL, or the request URL when absent.
fn next_location(current: &Url, headers: &HeaderMap) -> Result<Url> {
    match headers.get(LOCATION) {
        Some(value) => Ok(current.join(value.to_str()?)?),
        None => Ok(current.clone()),
    }
}

fn require_location(url: &Url, response: &Response) -> Result<Url> {
    if response.headers().contains_key(LOCATION) {
        return next_location(url, response.headers());
    }
    Err(RegistryError::Protocol(HttpError::from_body(
        response.status(),
        &Method::POST,
        url,
        b"upload session response has no Location header",
    )))
}

/// Bytes the server has committed, from a `Range: 0-<last>` header.
fn committed_offset(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let value = value.trim().trim_start_matches("bytes=");
    let (_, last) = value.split_once('-')?;
    last.trim().parse::<u64>().ok().map(|last| last + 1)
}
