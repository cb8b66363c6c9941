//! Verified manifest and blob reads

use crate::cache::BlobCache;
use crate::error::handlers::check_response;
use crate::error::{RegistryError, Result};
use crate::hash::{Hash, SHA256, VerifyingReader};
use crate::image::manifest::sniff_media_type;
use crate::image::{BlobReader, Descriptor, MediaType, accepted_manifest_types};
use crate::reference::{Reference, Repository};
use crate::registry::Transport;
use crate::registry::transport::{RoundTripper, request, set_header};
use crate::remote::Options;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Method, Request, Response, StatusCode};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Reads from one repository through an authenticated transport.
#[derive(Clone)]
pub struct Fetcher {
    repository: Repository,
    transport: Transport,
    cache: Option<Arc<dyn BlobCache>>,
}

impl Fetcher {
    /// Fetcher with pull scope on `repository`.
    pub async fn new(repository: &Repository, options: &Options) -> Result<Self> {
        let transport = options.repository_transport(repository, "pull").await?;
        Ok(Fetcher::with_transport(repository, transport, options))
    }

    pub fn with_transport(repository: &Repository, transport: Transport, options: &Options) -> Self {
        Fetcher {
            repository: repository.clone(),
            transport,
            cache: options.cache().cloned(),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// `/v2/<repo>/<kind>/<identifier>`
    pub(crate) fn url(&self, kind: &str, identifier: &str) -> Result<Url> {
        self.transport.url(&format!(
            "{}/{}/{}",
            self.repository.repository_str(),
            kind,
            identifier
        ))
    }

    fn manifest_request(&self, method: Method, reference: &Reference) -> Result<(Request, Url)> {
        let url = self.url("manifests", &reference.identifier())?;
        let mut req = request(method, url.clone());
        let accept: Vec<String> = accepted_manifest_types()
            .iter()
            .map(|m| m.as_str().to_string())
            .collect();
        set_header(&mut req, ACCEPT, &accept.join(","));
        Ok((req, url))
    }

    /// GET a manifest and verify its bytes against the reference digest and
    /// the server's `Docker-Content-Digest`.
    pub async fn fetch_manifest(&self, reference: &Reference) -> Result<(Bytes, Descriptor)> {
        if let (Some(hash), Some(cache)) = (reference.digest(), &self.cache) {
            if let Some(mut cached) = cache.load(hash).await? {
                let mut data = Vec::new();
                cached.read_to_end(&mut data).await?;
                if Hash::of(&data) == *hash {
                    let media_type = sniff_media_type(&data).unwrap_or(MediaType::OciManifest);
                    let desc = Descriptor::new(media_type, data.len() as u64, hash.clone());
                    return Ok((Bytes::from(data), desc));
                }
                warn!(manifest = %hash, "ignoring corrupt cached manifest");
            }
        }

        let (req, url) = self.manifest_request(Method::GET, reference)?;
        let response = self.transport.round_trip(req).await?;
        let response = check_response(response, &Method::GET, &url, &[StatusCode::OK]).await?;
        let media_type = content_type(response.headers());
        let server_digest = header_digest(response.headers())?;
        let body = response.bytes().await?;

        let computed = Hash::of(&body);
        if let Some(expected) = reference.digest() {
            if computed != *expected {
                return Err(RegistryError::Integrity(format!(
                    "manifest digest {} does not match requested digest {}",
                    computed, expected
                )));
            }
        }
        if let Some(server) = server_digest {
            if server != computed {
                // Docker Hub has been seen serving a stale digest header for tags.
                if reference.registry().is_default() && reference.digest().is_none() {
                    warn!(reference = %reference, server = %server, computed = %computed, "ignoring Docker-Content-Digest mismatch");
                } else {
                    return Err(RegistryError::Integrity(format!(
                        "manifest digest {} does not match Docker-Content-Digest {}",
                        computed, server
                    )));
                }
            }
        }

        let media_type = media_type
            .filter(|m| m.is_image() || m.is_index() || m.is_schema1())
            .or_else(|| sniff_media_type(&body))
            .unwrap_or(MediaType::OciManifest);
        debug!(reference = %reference, digest = %computed, media_type = %media_type, size = body.len(), "fetched manifest");

        if let (Some(hash), Some(cache)) = (reference.digest(), &self.cache) {
            let stored = cache.store(hash, Box::new(Cursor::new(body.clone()))).await?;
            drain(stored).await?;
        }
        let desc = Descriptor::new(media_type, body.len() as u64, computed);
        Ok((body, desc))
    }

    /// HEAD a manifest. Falls back to GET when the registry omits the
    /// headers needed to build a descriptor.
    pub async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor> {
        let (req, url) = self.manifest_request(Method::HEAD, reference)?;
        let response = self.transport.round_trip(req).await?;
        let response = check_response(response, &Method::HEAD, &url, &[StatusCode::OK]).await?;
        let headers = response.headers();
        match (content_type(headers), header_digest(headers)?, content_length(headers)) {
            (Some(media_type), Some(digest), Some(size)) => {
                if let Some(expected) = reference.digest() {
                    if *expected != digest {
                        return Err(RegistryError::Integrity(format!(
                            "HEAD returned digest {} for {}",
                            digest, reference
                        )));
                    }
                }
                Ok(Descriptor::new(media_type, size, digest))
            }
            _ => {
                debug!(reference = %reference, "HEAD response incomplete, falling back to GET");
                Ok(self.fetch_manifest(reference).await?.1)
            }
        }
    }

    /// HEAD a blob: `Some(size)` when present, `None` on 404.
    pub async fn head_blob(&self, hash: &Hash) -> Result<Option<u64>> {
        let url = self.url("blobs", &hash.to_string())?;
        let response = self.transport.round_trip(request(Method::HEAD, url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_response(response, &Method::HEAD, &url, &[StatusCode::OK]).await?;
        Ok(Some(content_length(response.headers()).unwrap_or(0)))
    }

    /// Stream a blob, verifying its digest (and size, when known) as it is read.
    pub async fn fetch_blob(&self, hash: &Hash, size: Option<u64>) -> Result<BlobReader> {
        self.fetch_blob_as(hash, size, None).await
    }

    /// Like [`Fetcher::fetch_blob`], sending `Accept: <media_type>`.
    pub async fn fetch_blob_as(
        &self,
        hash: &Hash,
        size: Option<u64>,
        media_type: Option<&MediaType>,
    ) -> Result<BlobReader> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.load(hash).await? {
                return Ok(Box::new(VerifyingReader::new(cached, hash.clone(), size)));
            }
        }

        let url = self.url("blobs", &hash.to_string())?;
        let mut req = request(Method::GET, url.clone());
        if let Some(media_type) = media_type {
            set_header(&mut req, ACCEPT, media_type.as_str());
        }
        let response = self.transport.round_trip(req).await?;
        let response = check_response(response, &Method::GET, &url, &[StatusCode::OK]).await?;
        if let (Some(expected), Some(got)) = (size, content_length(response.headers())) {
            if expected != got {
                return Err(RegistryError::Integrity(format!(
                    "blob {} is {} bytes, descriptor says {}",
                    hash, got, expected
                )));
            }
        }

        let body = body_reader(response, self.transport.cancel_token().clone());
        let verified: BlobReader = Box::new(VerifyingReader::new(body, hash.clone(), size));
        match &self.cache {
            Some(cache) => cache.store(hash, verified).await,
            None => Ok(verified),
        }
    }
}

/// Response body as a reader that fails with `Canceled` if the token fires
/// mid-stream.
pub(crate) fn body_reader(response: Response, cancel: CancellationToken) -> BlobReader {
    let canceled = cancel.clone();
    let body = response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .take_until(cancel.cancelled_owned())
        .chain(
            stream::once(async move { canceled.is_cancelled() }).filter_map(|canceled| async move {
                canceled.then(|| Err(RegistryError::Canceled.into_io()))
            }),
        );
    Box::new(StreamReader::new(Box::pin(body)))
}

async fn drain(mut reader: BlobReader) -> Result<()> {
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(())
}

fn content_type(headers: &HeaderMap) -> Option<MediaType> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(MediaType::from)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// The `Docker-Content-Digest` header. Digests in an algorithm other than
/// sha256 cannot be checked and are ignored.
fn header_digest(headers: &HeaderMap) -> Result<Option<Hash>> {
    let Some(value) = headers.get(DOCKER_CONTENT_DIGEST) else {
        return Ok(None);
    };
    let value = value.to_str()?.trim();
    match value.split_once(':') {
        Some((algorithm, _)) if algorithm == SHA256 => Ok(Some(value.parse()?)),
        _ => {
            debug!(digest = value, "ignoring Docker-Content-Digest in unsupported algorithm");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_digest(&headers).unwrap(), None);
        let hash = Hash::of(b"x");
        headers.insert(DOCKER_CONTENT_DIGEST, hash.to_string().parse().unwrap());
        headers.insert(CONTENT_LENGTH, "42".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/vnd.oci.image.index.v1+json".parse().unwrap());
        assert_eq!(header_digest(&headers).unwrap(), Some(hash));
        assert_eq!(content_length(&headers), Some(42));
        assert!(content_type(&headers).unwrap().is_index());

        headers.insert(DOCKER_CONTENT_DIGEST, "sha512:abc".parse().unwrap());
        assert_eq!(header_digest(&headers).unwrap(), None);
        headers.insert(DOCKER_CONTENT_DIGEST, "sha256:abc".parse().unwrap());
        assert!(header_digest(&headers).is_err());
    }
}
