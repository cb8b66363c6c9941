//! Tag and catalog listing with `Link` pagination
//!
//! Some registries (GCR and Artifact Registry) extend the tag list with the
//! names of child repositories and per-manifest metadata. The extension is
//! parsed when present; plain registries yield only `name` and `tags`.

use crate::error::handlers::check_response;
use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::MediaType;
use crate::reference::{Registry, Repository};
use crate::registry::Transport;
use crate::registry::transport::{RoundTripper, request};
use crate::remote::Options;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use url::Url;

/// Registry-reported metadata about one manifest in a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    pub size: u64,
    pub media_type: MediaType,
    /// Unix epoch milliseconds
    pub created_ms: u64,
    /// Unix epoch milliseconds
    pub uploaded_ms: u64,
    pub tags: Vec<String>,
}

impl ManifestInfo {
    pub fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_ms)
    }

    pub fn uploaded(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.uploaded_ms)
    }
}

/// One repository's tags, merged across pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    pub name: String,
    pub tags: Vec<String>,
    /// Child repository names, relative to this one
    pub children: Vec<String>,
    pub manifests: BTreeMap<Hash, ManifestInfo>,
}

impl Tags {
    /// Whether the registry sent the child/manifest extension.
    pub fn is_extended(&self) -> bool {
        !self.children.is_empty() || !self.manifests.is_empty()
    }

    /// Tag to digest, from the extension's manifest map.
    pub fn digest_of(&self, tag: &str) -> Option<&Hash> {
        self.manifests
            .iter()
            .find(|(_, info)| info.tags.iter().any(|t| t == tag))
            .map(|(hash, _)| hash)
    }

    fn merge(&mut self, page: TagsPage) -> Result<()> {
        if self.name.is_empty() {
            self.name = page.name;
        }
        self.tags.extend(page.tags.unwrap_or_default());
        self.children.extend(page.child);
        for (digest, raw) in page.manifest {
            let hash: Hash = digest.parse()?;
            self.manifests.insert(
                hash,
                ManifestInfo {
                    size: raw.image_size_bytes,
                    media_type: MediaType::from(raw.media_type.as_str()),
                    created_ms: raw.time_created_ms,
                    uploaded_ms: raw.time_uploaded_ms,
                    tags: raw.tag,
                },
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    child: Vec<String>,
    #[serde(default)]
    manifest: HashMap<String, RawManifestInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifestInfo {
    #[serde(default, deserialize_with = "number_or_string")]
    image_size_bytes: u64,
    #[serde(default)]
    media_type: String,
    #[serde(default, deserialize_with = "number_or_string")]
    time_created_ms: u64,
    #[serde(default, deserialize_with = "number_or_string")]
    time_uploaded_ms: u64,
    #[serde(default)]
    tag: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

/// Numbers in the extension arrive as JSON strings; accept both forms.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// The `rel="next"` target of a `Link` header, resolved against `current`.
fn next_page(current: &Url, headers: &HeaderMap) -> Result<Option<Url>> {
    let Some(value) = headers.get(LINK) else {
        return Ok(None);
    };
    for link in value.to_str()?.split(',') {
        let mut parts = link.split(';');
        let Some(target) = parts.next() else { continue };
        let is_next = parts.any(|p| {
            p.trim()
                .strip_prefix("rel=")
                .is_some_and(|rel| rel.trim_matches('"') == "next")
        });
        if is_next {
            let target = target.trim().trim_start_matches('<').trim_end_matches('>');
            return Ok(Some(current.join(target)?));
        }
    }
    Ok(None)
}

/// GET `url` and every page after it, handing each body to `on_page`.
async fn paginate<F>(transport: &Transport, mut url: Url, mut on_page: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    loop {
        if transport.cancel_token().is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        let response = transport.round_trip(request(Method::GET, url.clone())).await?;
        let response = check_response(response, &Method::GET, &url, &[StatusCode::OK]).await?;
        let next = next_page(&url, response.headers())?;
        let body = response.bytes().await?;
        on_page(&body)?;
        match next {
            Some(next) => {
                debug!(next = %next, "following pagination link");
                url = next;
            }
            None => return Ok(()),
        }
    }
}

fn with_page_size(mut url: Url, options: &Options) -> Url {
    if let Some(n) = options.page_size() {
        url.query_pairs_mut().append_pair("n", &n.to_string());
    }
    url
}

/// Every page of `/v2/<repo>/tags/list` over an existing transport.
pub(crate) async fn list_with(transport: &Transport, repository: &Repository, options: &Options) -> Result<Tags> {
    let url = transport.url(&format!("{}/tags/list", repository.repository_str()))?;
    let mut tags = Tags::default();
    paginate(transport, with_page_size(url, options), |body| {
        tags.merge(serde_json::from_slice(body)?)
    })
    .await?;
    Ok(tags)
}

/// Tags of `repository`, with the child/manifest extension when the
/// registry provides it.
pub async fn list(repository: &Repository, options: &Options) -> Result<Tags> {
    let transport = options.repository_transport(repository, "pull").await?;
    list_with(&transport, repository, options).await
}

/// Tag names of `repository`.
pub async fn list_tags(repository: &Repository, options: &Options) -> Result<Vec<String>> {
    Ok(list(repository, options).await?.tags)
}

/// Repository names from `/v2/_catalog`.
pub async fn catalog(registry: &Registry, options: &Options) -> Result<Vec<String>> {
    let transport = options
        .transport(registry, registry, vec![registry.scope("*")])
        .await?;
    let url = transport.url("_catalog")?;
    let mut repositories = Vec::new();
    paginate(&transport, with_page_size(url, options), |body| {
        let page: CatalogPage = serde_json::from_slice(body)?;
        repositories.extend(page.repositories);
        Ok(())
    })
    .await?;
    Ok(repositories)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_page_resolution() {
        let current = Url::parse("https://r.example/v2/a/tags/list?n=2").unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(next_page(&current, &headers).unwrap(), None);

        headers.insert(LINK, r#"</v2/a/tags/list?n=2&last=b>; rel="next""#.parse().unwrap());
        assert_eq!(
            next_page(&current, &headers).unwrap().unwrap().as_str(),
            "https://r.example/v2/a/tags/list?n=2&last=b"
        );

        headers.insert(LINK, r#"<https://other.example/page2>; rel=next"#.parse().unwrap());
        assert_eq!(
            next_page(&current, &headers).unwrap().unwrap().host_str(),
            Some("other.example")
        );

        headers.insert(LINK, r#"</v2/a/tags/list?last=a>; rel="prev""#.parse().unwrap());
        assert_eq!(next_page(&current, &headers).unwrap(), None);
    }

    #[test]
    fn test_extension_parsing() {
        let d1 = Hash::of(b"one");
        let body = format!(
            r#"{{"name":"p/a","tags":["v1"],"child":["b"],"manifest":{{"{}":{{
                "imageSizeBytes":"1234","mediaType":"application/vnd.oci.image.manifest.v1+json",
                "timeCreatedMs":"1700000000000","timeUploadedMs":1700000001000,"tag":["v1"]}}}}}}"#,
            d1
        );
        let mut tags = Tags::default();
        tags.merge(serde_json::from_str(&body).unwrap()).unwrap();
        assert!(tags.is_extended());
        assert_eq!(tags.children, vec!["b"]);
        let info = &tags.manifests[&d1];
        assert_eq!(info.size, 1234);
        assert_eq!(info.media_type, MediaType::OciManifest);
        assert_eq!(info.created(), UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert_eq!(info.uploaded_ms, 1_700_000_001_000);
        assert_eq!(tags.digest_of("v1"), Some(&d1));
    }

    #[test]
    fn test_plain_and_null_tags() {
        let mut tags = Tags::default();
        tags.merge(serde_json::from_str(r#"{"name":"a","tags":null}"#).unwrap()).unwrap();
        assert!(tags.tags.is_empty());
        assert!(!tags.is_extended());
    }
}
