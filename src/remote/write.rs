//! Pushing images, indexes and raw manifests

use crate::error::handlers::check_response;
use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::{Artifact, Image, Index, Layer, MediaType};
use crate::reference::{Reference, Repository};
use crate::registry::Transport;
use crate::registry::transport::{RoundTripper, request, request_with_body, set_header};
use crate::remote::Options;
use crate::remote::fetcher::{DOCKER_CONTENT_DIGEST, Fetcher};
use crate::remote::upload::{BlobOutcome, BlobUploader};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts of what a push actually had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub existing: usize,
    pub mounted: usize,
    pub uploaded: usize,
    pub bytes: u64,
    pub manifests: usize,
}

impl PushStats {
    fn record(&mut self, outcome: BlobOutcome) {
        match outcome {
            BlobOutcome::Existing => self.existing += 1,
            BlobOutcome::Mounted => self.mounted += 1,
            BlobOutcome::Uploaded { bytes } => {
                self.uploaded += 1;
                self.bytes += bytes;
            }
        }
    }

    pub fn merge(&mut self, other: PushStats) {
        self.existing += other.existing;
        self.mounted += other.mounted;
        self.uploaded += other.uploaded;
        self.bytes += other.bytes;
        self.manifests += other.manifests;
    }
}

/// Writes artifacts into one repository.
pub struct Writer {
    repository: Repository,
    transport: Transport,
    fetcher: Fetcher,
    mount: Vec<Repository>,
    jobs: usize,
    chunk_size: usize,
}

impl Writer {
    /// Writer holding push and pull scope on `repository`, plus pull scope on
    /// every mount source that lives on the same registry.
    pub async fn new(repository: &Repository, options: &Options, sources: &[Repository]) -> Result<Self> {
        let mut mount: Vec<Repository> = Vec::new();
        for source in sources.iter().chain(options.mount()) {
            if source.registry() == repository.registry()
                && source != repository
                && !mount.contains(source)
            {
                mount.push(source.clone());
            }
        }
        let mut scopes = vec![repository.scope("push,pull")];
        scopes.extend(mount.iter().map(|r| r.scope("pull")));

        let transport = options
            .transport(repository, repository.registry(), scopes)
            .await?;
        let fetcher = Fetcher::with_transport(repository, transport.clone(), options);
        Ok(Writer {
            repository: repository.clone(),
            transport,
            fetcher,
            mount,
            jobs: options.jobs(),
            chunk_size: options.chunk_size(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub async fn blob_exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.fetcher.head_blob(hash).await?.is_some())
    }

    /// Make one blob present: HEAD, then mount, then upload.
    pub async fn write_blob(&self, layer: &dyn Layer) -> Result<BlobOutcome> {
        if self.blob_exists(layer.digest()).await? {
            debug!(blob = %layer.digest(), "blob already present");
            return Ok(BlobOutcome::Existing);
        }
        let mut sources: Vec<Repository> = Vec::new();
        if let Some(source) = layer.mount_source() {
            if self.mount.contains(source) {
                sources.push(source.clone());
            }
        }
        for source in &self.mount {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        }
        BlobUploader::new(&self.repository, &self.transport, self.chunk_size)
            .upload(layer, &sources)
            .await
    }

    async fn write_owned_blob(&self, layer: Arc<dyn Layer>) -> Result<BlobOutcome> {
        self.write_blob(layer.as_ref()).await
    }

    /// Push every blob of `image` with at most `jobs` in flight, then the
    /// manifest under `identifier` (a tag or digest string).
    pub async fn write_image(&self, image: &dyn Image, identifier: &str) -> Result<PushStats> {
        let mut blobs: Vec<Arc<dyn Layer>> = vec![image.config_layer().await?];
        blobs.extend(image.layers().await?);

        let mut seen = HashSet::new();
        let blobs: Vec<Arc<dyn Layer>> = blobs
            .into_iter()
            .filter(|l| {
                if !l.media_type().is_distributable() {
                    debug!(blob = %l.digest(), media_type = %l.media_type(), "skipping foreign layer");
                    return false;
                }
                seen.insert(l.digest().clone())
            })
            .collect();

        let uploads: Vec<_> = blobs
            .into_iter()
            .map(|layer| self.write_owned_blob(layer))
            .collect();
        let outcomes: Vec<BlobOutcome> = stream::iter(uploads)
            .buffer_unordered(self.jobs)
            .try_collect()
            .await?;

        let mut stats = PushStats::default();
        for outcome in outcomes {
            stats.record(outcome);
        }
        let raw = image.raw_manifest().await?;
        self.put_manifest(identifier, raw, &image.media_type().await?)
            .await?;
        stats.manifests += 1;
        Ok(stats)
    }

    /// Push every child of `index` by digest, then the index itself.
    ///
    /// Boxed because nested indexes recurse.
    pub fn write_index<'a>(
        &'a self,
        index: Arc<dyn Index>,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<PushStats>> {
        Box::pin(async move {
            let manifest = index.index_manifest().await?;
            let mut stats = PushStats::default();
            for desc in &manifest.manifests {
                let child = Reference::from(self.repository.digest(desc.digest.clone()));
                if self.manifest_exists(&child).await? {
                    debug!(child = %desc.digest, "child manifest already present");
                    continue;
                }
                let id = desc.digest.to_string();
                let child_stats = match index.child(desc).await? {
                    Artifact::Image(img) => self.write_image(img.as_ref(), &id).await?,
                    Artifact::Index(idx) => self.write_index(idx, &id).await?,
                };
                stats.merge(child_stats);
            }
            let raw = index.raw_manifest().await?;
            self.put_manifest(identifier, raw, &index.media_type().await?)
                .await?;
            stats.manifests += 1;
            Ok(stats)
        })
    }

    pub async fn write_artifact(&self, artifact: &Artifact, identifier: &str) -> Result<PushStats> {
        match artifact {
            Artifact::Image(img) => self.write_image(img.as_ref(), identifier).await,
            Artifact::Index(idx) => self.write_index(idx.clone(), identifier).await,
        }
    }

    async fn manifest_exists(&self, reference: &Reference) -> Result<bool> {
        match self.fetcher.head_manifest(reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// PUT manifest bytes unchanged under `identifier`.
    pub async fn put_manifest(&self, identifier: &str, raw: Bytes, media_type: &MediaType) -> Result<Hash> {
        let digest = Hash::of(&raw);
        let url = self.fetcher.url("manifests", identifier)?;
        let mut req = request_with_body(Method::PUT, url.clone(), raw);
        set_header(&mut req, CONTENT_TYPE, media_type.as_str());
        let response = self.transport.round_trip(req).await?;
        let response = check_response(
            response,
            &Method::PUT,
            &url,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED],
        )
        .await?;
        if let Some(server) = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
        {
            if server != digest.to_string() {
                warn!(repository = %self.repository, identifier, server, computed = %digest, "registry reported a different manifest digest");
            }
        }
        info!(repository = %self.repository, identifier, digest = %digest, "pushed manifest");
        Ok(digest)
    }

    pub async fn delete_manifest(&self, identifier: &str) -> Result<()> {
        let url = self.fetcher.url("manifests", identifier)?;
        self.delete(url).await
    }

    pub async fn delete_blob(&self, hash: &Hash) -> Result<()> {
        let url = self.fetcher.url("blobs", &hash.to_string())?;
        self.delete(url).await
    }

    async fn delete(&self, url: url::Url) -> Result<()> {
        let response = self.transport.round_trip(request(Method::DELETE, url.clone())).await?;
        check_response(
            response,
            &Method::DELETE,
            &url,
            &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        )
        .await?;
        info!(url = %url.path(), "deleted");
        Ok(())
    }
}

/// Identifier a manifest is written under: the tag (including the tag of a
/// `tag@digest` reference), or the digest.
pub(crate) fn write_identifier(reference: &Reference, digest: &Hash) -> Result<String> {
    match reference.digest() {
        Some(expected) if expected != digest => Err(RegistryError::Integrity(format!(
            "cannot write manifest {} to {}",
            digest, reference
        ))),
        _ => Ok(reference.write_target().identifier()),
    }
}
