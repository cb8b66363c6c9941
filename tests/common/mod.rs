//! In-process registry speaking enough of the distribution API for the
//! integration tests. Plugged in underneath the real transport stack through
//! `Options::with_transport`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use oci_crane::error::Result;
use oci_crane::hash::Hash;
use oci_crane::image::{BytesLayer, ConfigFile, Layer, MediaType, MemoryImage};
use oci_crane::keychain::Authenticator;
use oci_crane::registry::{Backoff, RoundTripper};
use oci_crane::remote::Options;
use reqwest::{Method, Request, Response};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

pub const HOST: &str = "registry.test";
pub const AUTH_HOST: &str = "auth.test";

#[derive(Debug, Clone)]
pub struct Logged {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: String,
}

#[derive(Clone)]
struct Stored {
    raw: Bytes,
    media_type: String,
}

struct Session {
    repository: String,
    data: Vec<u8>,
}

struct Bearer {
    accepted: String,
    issued: Vec<String>,
}

#[derive(Default)]
struct State {
    repositories: BTreeSet<String>,
    manifests: HashMap<String, BTreeMap<String, Stored>>,
    blobs: HashMap<String, HashMap<String, Bytes>>,
    sessions: HashMap<String, Session>,
    next_session: u64,
    patches: usize,
    token_requests: usize,
    token_credentials: Vec<String>,
    token_scopes: Vec<Vec<String>>,
    log: Vec<Logged>,
    extension: bool,
    mount_status: Option<u16>,
    bearer: Option<Bearer>,
    demand_scope: Option<String>,
    fault: Option<(usize, u64)>,
    failures: Vec<(Method, String, u16)>,
    wrong_digest_header: bool,
}

/// Registry state keyed by `host/repository`, so one fake can serve
/// several registries.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<State>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRegistry::default())
    }

    /// Anonymous options routed through this registry, without backoff
    /// delays.
    pub fn options(self: &Arc<Self>) -> Options {
        Options::new()
            .with_auth(Authenticator::Anonymous)
            .with_transport(self.clone())
            .with_backoff(Backoff::none())
            .with_jobs(2)
    }

    /// Answer tag listings with the `child` and `manifest` extension.
    pub fn enable_extension(&self) {
        self.state.lock().unwrap().extension = true;
    }

    /// Answer every cross-repository mount with 202 and a fresh upload
    /// session, as registries do when they decline to mount.
    pub fn refuse_mounts(&self) {
        self.state.lock().unwrap().mount_status = Some(202);
    }

    /// Reject cross-repository mounts with 403.
    pub fn forbid_mounts(&self) {
        self.state.lock().unwrap().mount_status = Some(403);
    }

    /// Answer the next `method` request whose path contains `fragment` with
    /// `status`, once.
    pub fn fail_next(&self, method: Method, fragment: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((method, fragment.to_string(), status));
    }

    /// Send a `Docker-Content-Digest` that does not match the manifest body.
    pub fn send_wrong_digest_header(&self) {
        self.state.lock().unwrap().wrong_digest_header = true;
    }

    /// Serve `raw` for `identifier` without touching any other key.
    pub fn tamper_manifest(&self, repository: &str, identifier: &str, raw: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .manifests
            .get_mut(&format!("{}/{}", HOST, repository))
            .and_then(|m| m.get_mut(identifier))
            .unwrap();
        stored.raw = Bytes::copy_from_slice(raw);
    }

    /// With a bearer requirement set, answer the next authorized request
    /// with a 403 `insufficient_scope` challenge naming `scope`.
    pub fn demand_scope_once(&self, scope: &str) {
        self.state.lock().unwrap().demand_scope = Some(scope.to_string());
    }

    /// Upload sessions opened and neither committed nor deleted.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Require `Bearer <accepted>`. The token endpoint hands out `issued`
    /// in order and repeats the last one.
    pub fn require_bearer(&self, accepted: &str, issued: &[&str]) {
        self.state.lock().unwrap().bearer = Some(Bearer {
            accepted: accepted.to_string(),
            issued: issued.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// On the `nth` PATCH (1-based), drop everything past `keep` bytes of
    /// the session and answer 416.
    pub fn fail_patch(&self, nth: usize, keep: u64) {
        self.state.lock().unwrap().fault = Some((nth, keep));
    }

    /// Create an empty repository.
    pub fn create_repository(&self, repository: &str) {
        self.state
            .lock()
            .unwrap()
            .repositories
            .insert(format!("{}/{}", HOST, repository));
    }

    pub fn has_blob(&self, repository: &str, hash: &Hash) -> bool {
        let state = self.state.lock().unwrap();
        state
            .blobs
            .get(&format!("{}/{}", HOST, repository))
            .is_some_and(|b| b.contains_key(&hash.to_string()))
    }

    pub fn blob(&self, repository: &str, hash: &Hash) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .blobs
            .get(&format!("{}/{}", HOST, repository))?
            .get(&hash.to_string())
            .cloned()
    }

    pub fn manifest(&self, repository: &str, identifier: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state
            .manifests
            .get(&format!("{}/{}", HOST, repository))?
            .get(identifier)
            .map(|m| m.raw.clone())
    }

    pub fn tags(&self, repository: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        tags_of(&state, &format!("{}/{}", HOST, repository))
    }

    pub fn requests(&self) -> Vec<Logged> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Requests with `method` whose path contains `fragment`.
    pub fn count(&self, method: Method, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path.contains(fragment))
            .count()
    }

    pub fn token_requests(&self) -> usize {
        self.state.lock().unwrap().token_requests
    }

    /// `Authorization` headers the token endpoint received, empty when none.
    pub fn token_credentials(&self) -> Vec<String> {
        self.state.lock().unwrap().token_credentials.clone()
    }

    /// `scope` parameters of each token request, in order.
    pub fn token_scopes(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().token_scopes.clone()
    }

    fn handle(&self, request: &Request) -> Response {
        let url = request.url();
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let mut state = self.state.lock().unwrap();
        state.log.push(Logged {
            method: request.method().clone(),
            host: host.clone(),
            path: url.path().to_string(),
            query: url.query().unwrap_or_default().to_string(),
        });

        if host == AUTH_HOST {
            let credentials = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            state.token_credentials.push(credentials);
            let scopes = url
                .query_pairs()
                .filter(|(k, _)| k == "scope")
                .map(|(_, v)| v.into_owned())
                .collect();
            state.token_scopes.push(scopes);
            return issue_token(&mut state);
        }

        let failure = state
            .failures
            .iter()
            .position(|(m, fragment, _)| m == request.method() && url.path().contains(fragment.as_str()));
        if let Some(i) = failure {
            let (_, _, status) = state.failures.remove(i);
            return error(status, "UNAVAILABLE", "injected failure");
        }

        let Some(path) = url.path().strip_prefix("/v2/") else {
            return error(404, "NOT_FOUND", "no such endpoint");
        };
        if path.is_empty() {
            return match &state.bearer {
                Some(_) => challenge(),
                None => respond(200, &[], Bytes::new()),
            };
        }
        if let Some(bearer) = &state.bearer {
            let expected = format!("Bearer {}", bearer.accepted);
            let sent = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            if sent != Some(expected.as_str()) {
                return challenge();
            }
            if let Some(scope) = state.demand_scope.take() {
                return insufficient_scope(&scope);
            }
        }

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let body = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let method = request.method().clone();

        if path == "_catalog" {
            return catalog(&state, &host, &query);
        }
        if let Some(repository) = path.strip_suffix("/tags/list") {
            return list_tags(&state, &format!("{}/{}", host, repository), repository, &query);
        }
        if let Some((repository, session)) = path.split_once("/blobs/uploads/") {
            let key = format!("{}/{}", host, repository);
            return upload(&mut state, &key, repository, session, &method, &query, request, body);
        }
        if let Some((repository, identifier)) = path.rsplit_once("/manifests/") {
            let key = format!("{}/{}", host, repository);
            return manifest(&mut state, &key, repository, identifier, &method, request, body);
        }
        if let Some((repository, digest)) = path.rsplit_once("/blobs/") {
            let key = format!("{}/{}", host, repository);
            return blob(&mut state, &key, digest, &method);
        }
        error(404, "NOT_FOUND", "no such endpoint")
    }
}

#[async_trait]
impl RoundTripper for FakeRegistry {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        Ok(self.handle(&request))
    }
}

fn respond(status: u16, headers: &[(&str, String)], body: Bytes) -> Response {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    Response::from(builder.body(body).unwrap())
}

fn error(status: u16, code: &str, message: &str) -> Response {
    let body = serde_json::json!({"errors": [{"code": code, "message": message}]});
    respond(
        status,
        &[("content-type", "application/json".to_string())],
        Bytes::from(body.to_string()),
    )
}

fn challenge() -> Response {
    respond(
        401,
        &[(
            "www-authenticate",
            format!(r#"Bearer realm="https://{}/token",service="{}""#, AUTH_HOST, HOST),
        )],
        Bytes::from_static(br#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#),
    )
}

fn insufficient_scope(scope: &str) -> Response {
    respond(
        403,
        &[(
            "www-authenticate",
            format!(
                r#"Bearer realm="https://{}/token",service="{}",scope="{}",error="insufficient_scope""#,
                AUTH_HOST, HOST, scope
            ),
        )],
        Bytes::from_static(br#"{"errors":[{"code":"DENIED","message":"requested access to the resource is denied"}]}"#),
    )
}

fn issue_token(state: &mut State) -> Response {
    state.token_requests += 1;
    let Some(bearer) = &state.bearer else {
        return error(404, "NOT_FOUND", "no token endpoint");
    };
    let index = (state.token_requests - 1).min(bearer.issued.len().saturating_sub(1));
    let token = bearer.issued.get(index).cloned().unwrap_or_default();
    let body = serde_json::json!({"token": token, "expires_in": 300});
    respond(200, &[], Bytes::from(body.to_string()))
}

fn is_digest(identifier: &str) -> bool {
    identifier.starts_with("sha256:")
}

fn tags_of(state: &State, key: &str) -> Vec<String> {
    state
        .manifests
        .get(key)
        .map(|m| m.keys().filter(|k| !is_digest(k)).cloned().collect())
        .unwrap_or_default()
}

fn known_repositories(state: &State) -> BTreeSet<String> {
    let mut all = state.repositories.clone();
    all.extend(state.manifests.keys().cloned());
    all.extend(state.blobs.keys().cloned());
    all
}

fn exists(state: &State, key: &str) -> bool {
    let prefix = format!("{}/", key);
    known_repositories(state)
        .iter()
        .any(|r| r == key || r.starts_with(&prefix))
}

fn page(items: Vec<String>, query: &HashMap<String, String>) -> (Vec<String>, Option<String>) {
    let after: Vec<String> = match query.get("last") {
        Some(last) => items.into_iter().filter(|i| i > last).collect(),
        None => items,
    };
    match query.get("n").and_then(|n| n.parse::<usize>().ok()) {
        Some(n) if after.len() > n => {
            let last = after[n - 1].clone();
            (after.into_iter().take(n).collect(), Some(last))
        }
        _ => (after, None),
    }
}

fn list_tags(
    state: &State,
    key: &str,
    repository: &str,
    query: &HashMap<String, String>,
) -> Response {
    if !exists(state, key) {
        return error(404, "NAME_UNKNOWN", "repository name not known to registry");
    }
    let tags = tags_of(state, key);
    let (tags, last) = page(tags, query);
    let mut doc = serde_json::json!({
        "name": repository,
        "tags": if tags.is_empty() { serde_json::Value::Null } else { serde_json::json!(tags) },
    });

    if state.extension {
        let prefix = format!("{}/", key);
        let children: BTreeSet<String> = known_repositories(state)
            .iter()
            .filter_map(|r| r.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        let mut manifests = serde_json::Map::new();
        if let Some(stored) = state.manifests.get(key) {
            for (identifier, m) in stored.iter().filter(|(k, _)| is_digest(k)) {
                let tags: Vec<&String> = stored
                    .iter()
                    .filter(|(k, other)| !is_digest(k) && other.raw == m.raw)
                    .map(|(k, _)| k)
                    .collect();
                manifests.insert(
                    identifier.clone(),
                    serde_json::json!({
                        "imageSizeBytes": m.raw.len().to_string(),
                        "mediaType": m.media_type,
                        "tag": tags,
                        "timeCreatedMs": "0",
                        "timeUploadedMs": "0",
                    }),
                );
            }
        }
        doc["child"] = serde_json::json!(children);
        doc["manifest"] = serde_json::Value::Object(manifests);
    }

    let mut headers = vec![("content-type", "application/json".to_string())];
    if let Some(last) = last {
        let n = query.get("n").cloned().unwrap_or_default();
        headers.push((
            "link",
            format!("</v2/{}/tags/list?n={}&last={}>; rel=\"next\"", repository, n, last),
        ));
    }
    respond(200, &headers, Bytes::from(doc.to_string()))
}

fn catalog(state: &State, host: &str, query: &HashMap<String, String>) -> Response {
    let prefix = format!("{}/", host);
    let names: Vec<String> = state
        .manifests
        .keys()
        .chain(state.repositories.iter())
        .filter_map(|k| k.strip_prefix(&prefix))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let (names, last) = page(names, query);
    let mut headers = Vec::new();
    if let Some(last) = last {
        let n = query.get("n").cloned().unwrap_or_default();
        headers.push(("link", format!("</v2/_catalog?n={}&last={}>; rel=\"next\"", n, last)));
    }
    let body = serde_json::json!({ "repositories": names });
    respond(200, &headers, Bytes::from(body.to_string()))
}

fn manifest(
    state: &mut State,
    key: &str,
    repository: &str,
    identifier: &str,
    method: &Method,
    request: &Request,
    body: Bytes,
) -> Response {
    match *method {
        Method::GET | Method::HEAD => {
            let Some(m) = state.manifests.get(key).and_then(|m| m.get(identifier)) else {
                return error(404, "MANIFEST_UNKNOWN", "manifest unknown");
            };
            let digest = if state.wrong_digest_header {
                Hash::of(b"not the manifest")
            } else {
                Hash::of(&m.raw)
            };
            let headers = [
                ("content-type", m.media_type.clone()),
                ("docker-content-digest", digest.to_string()),
                ("content-length", m.raw.len().to_string()),
            ];
            let body = if *method == Method::GET {
                m.raw.clone()
            } else {
                Bytes::new()
            };
            respond(200, &headers, body)
        }
        Method::PUT => {
            let digest = Hash::of(&body);
            if is_digest(identifier) && identifier != digest.to_string() {
                return error(400, "DIGEST_INVALID", "manifest digest did not match");
            }
            let media_type = request
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let stored = Stored {
                raw: body,
                media_type,
            };
            let entry = state.manifests.entry(key.to_string()).or_default();
            entry.insert(digest.to_string(), stored.clone());
            entry.insert(identifier.to_string(), stored);
            respond(
                201,
                &[
                    ("docker-content-digest", digest.to_string()),
                    ("location", format!("/v2/{}/manifests/{}", repository, digest)),
                ],
                Bytes::new(),
            )
        }
        Method::DELETE => {
            let Some(entry) = state.manifests.get_mut(key) else {
                return error(404, "MANIFEST_UNKNOWN", "manifest unknown");
            };
            let Some(removed) = entry.remove(identifier) else {
                return error(404, "MANIFEST_UNKNOWN", "manifest unknown");
            };
            entry.retain(|_, m| m.raw != removed.raw);
            respond(202, &[], Bytes::new())
        }
        _ => error(405, "UNSUPPORTED", "method not allowed"),
    }
}

fn blob(state: &mut State, key: &str, digest: &str, method: &Method) -> Response {
    match *method {
        Method::GET | Method::HEAD => {
            let Some(data) = state.blobs.get(key).and_then(|b| b.get(digest)) else {
                return error(404, "BLOB_UNKNOWN", "blob unknown to registry");
            };
            let headers = [
                ("content-length", data.len().to_string()),
                ("docker-content-digest", digest.to_string()),
                ("content-type", "application/octet-stream".to_string()),
            ];
            let body = if *method == Method::GET {
                data.clone()
            } else {
                Bytes::new()
            };
            respond(200, &headers, body)
        }
        Method::DELETE => match state.blobs.get_mut(key).and_then(|b| b.remove(digest)) {
            Some(_) => respond(202, &[], Bytes::new()),
            None => error(404, "BLOB_UNKNOWN", "blob unknown to registry"),
        },
        _ => error(405, "UNSUPPORTED", "method not allowed"),
    }
}

fn session_location(repository: &str, id: &str) -> String {
    format!("/v2/{}/blobs/uploads/{}", repository, id)
}

fn range_header(len: usize) -> Vec<(&'static str, String)> {
    if len == 0 {
        Vec::new()
    } else {
        vec![("range", format!("0-{}", len - 1))]
    }
}

#[allow(clippy::too_many_arguments)]
fn upload(
    state: &mut State,
    key: &str,
    repository: &str,
    session: &str,
    method: &Method,
    query: &HashMap<String, String>,
    request: &Request,
    body: Bytes,
) -> Response {
    match *method {
        Method::POST => {
            if let (Some(digest), Some(from)) = (query.get("mount"), query.get("from")) {
                if state.mount_status == Some(403) {
                    return error(403, "DENIED", "mount not permitted");
                }
                let host = key.split('/').next().unwrap_or_default();
                let source = format!("{}/{}", host, from);
                let data = state.blobs.get(&source).and_then(|b| b.get(digest)).cloned();
                let data = data.filter(|_| state.mount_status.is_none());
                if let Some(data) = data {
                    state
                        .blobs
                        .entry(key.to_string())
                        .or_default()
                        .insert(digest.clone(), data);
                    return respond(
                        201,
                        &[("location", format!("/v2/{}/blobs/{}", repository, digest))],
                        Bytes::new(),
                    );
                }
            }
            state.next_session += 1;
            let id = format!("session-{}", state.next_session);
            state.sessions.insert(
                id.clone(),
                Session {
                    repository: key.to_string(),
                    data: Vec::new(),
                },
            );
            respond(202, &[("location", session_location(repository, &id))], Bytes::new())
        }
        Method::PATCH => {
            state.patches += 1;
            let patches = state.patches;
            let fault = state.fault;
            let Some(s) = state.sessions.get_mut(session) else {
                return error(404, "BLOB_UPLOAD_UNKNOWN", "upload unknown");
            };
            let location = session_location(repository, session);
            if let Some((nth, keep)) = fault {
                if nth == patches {
                    s.data.truncate(keep as usize);
                    let mut headers = range_header(s.data.len());
                    headers.push(("location", location));
                    return respond(416, &headers, Bytes::new());
                }
            }
            let start = request
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split_once('-'))
                .and_then(|(start, _)| start.parse::<usize>().ok())
                .unwrap_or(s.data.len());
            if start != s.data.len() {
                let mut headers = range_header(s.data.len());
                headers.push(("location", location));
                return respond(416, &headers, Bytes::new());
            }
            s.data.extend_from_slice(&body);
            let mut headers = range_header(s.data.len());
            headers.push(("location", location));
            respond(202, &headers, Bytes::new())
        }
        Method::DELETE => match state.sessions.remove(session) {
            Some(_) => respond(204, &[], Bytes::new()),
            None => error(404, "BLOB_UPLOAD_UNKNOWN", "upload unknown"),
        },
        Method::PUT => {
            let Some(mut s) = state.sessions.remove(session) else {
                return error(404, "BLOB_UPLOAD_UNKNOWN", "upload unknown");
            };
            s.data.extend_from_slice(&body);
            let Some(digest) = query.get("digest") else {
                return error(400, "DIGEST_INVALID", "digest missing");
            };
            let actual = Hash::of(&s.data).to_string();
            if *digest != actual {
                return error(400, "DIGEST_INVALID", "provided digest did not match uploaded content");
            }
            state
                .blobs
                .entry(s.repository)
                .or_default()
                .insert(actual.clone(), Bytes::from(s.data));
            respond(
                201,
                &[
                    ("location", format!("/v2/{}/blobs/{}", repository, actual)),
                    ("docker-content-digest", actual),
                ],
                Bytes::new(),
            )
        }
        _ => error(405, "UNSUPPORTED", "method not allowed"),
    }
}

/// A single-layer image whose layer gzips `content`.
pub fn image_with(content: &[u8]) -> MemoryImage {
    let layer = BytesLayer::gzip(Bytes::copy_from_slice(content)).unwrap();
    image_of(vec![Arc::new(layer)])
}

pub fn image_of(layers: Vec<Arc<dyn Layer>>) -> MemoryImage {
    let config = ConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        ..ConfigFile::default()
    };
    MemoryImage::new(MediaType::OciManifest, config, layers).unwrap()
}
