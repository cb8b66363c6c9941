mod common;

use common::{FakeRegistry, HOST, image_with};
use oci_crane::RegistryError;
use oci_crane::copy::{RecursiveCopier, copy};
use oci_crane::image::{Artifact, Image, MediaType, MemoryIndex, Platform};
use oci_crane::keychain::DefaultKeychain;
use oci_crane::reference::{Reference, Repository, Validation};
use oci_crane::registry::Backoff;
use oci_crane::remote;
use reqwest::Method;
use std::sync::Arc;

fn reference(s: &str) -> Reference {
    Reference::parse(&format!("{}/{}", HOST, s), Validation::Weak).unwrap()
}

fn repository(s: &str) -> Repository {
    Repository::new(&format!("{}/{}", HOST, s), Validation::Weak).unwrap()
}

#[tokio::test]
async fn test_copy_mounts_within_registry() {
    let registry = FakeRegistry::new();
    let options = registry.options();
    let image = image_with(b"mount me");
    remote::write(&reference("src/app:v1"), &image, &options).await.unwrap();
    registry.clear_log();

    let stats = copy(&reference("src/app:v1"), &reference("dst/app:v1"), &options)
        .await
        .unwrap();
    assert_eq!(stats.mounted, 2);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(registry.count(Method::PATCH, "/blobs/uploads/"), 0);
    assert_eq!(
        registry.manifest("dst/app", "v1"),
        registry.manifest("src/app", "v1")
    );
}

#[tokio::test]
async fn test_copy_uploads_when_mount_refused() {
    let registry = FakeRegistry::new();
    let options = registry.options();
    let image = image_with(b"no mounts here");
    remote::write(&reference("src/app:v1"), &image, &options).await.unwrap();
    registry.refuse_mounts();
    registry.clear_log();

    let stats = copy(&reference("src/app:v1"), &reference("dst/app:v1"), &options)
        .await
        .unwrap();
    assert_eq!(stats.mounted, 0);
    assert_eq!(stats.uploaded, 2);
    let layer = &image.layers().await.unwrap()[0];
    assert!(registry.has_blob("dst/app", layer.digest()));
    // The session opened by the refused mount carries the upload.
    assert_eq!(registry.count(Method::POST, "/blobs/uploads/"), 2);
    assert_eq!(registry.open_sessions(), 0);
}

#[tokio::test]
async fn test_copy_fails_when_mount_forbidden() {
    let registry = FakeRegistry::new();
    let options = registry.options();
    remote::write(&reference("src/app:v1"), &image_with(b"forbidden"), &options)
        .await
        .unwrap();
    registry.forbid_mounts();

    let err = copy(&reference("src/app:v1"), &reference("dst/app:v1"), &options)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RegistryError::Unauthorized(_)), "unexpected error {:?}", err);
    assert!(registry.manifest("dst/app", "v1").is_none());
}

#[tokio::test]
async fn test_extra_refused_mount_sessions_are_closed() {
    let registry = FakeRegistry::new();
    registry.refuse_mounts();
    let options = registry
        .options()
        .with_mount(vec![repository("src/one"), repository("src/two")]);

    let stats = remote::write(&reference("dst/app:v1"), &image_with(b"two sources"), &options)
        .await
        .unwrap();
    assert_eq!(stats.uploaded, 2);
    // Two mount attempts per blob, the second session of each deleted.
    assert_eq!(registry.count(Method::POST, "/blobs/uploads/"), 4);
    assert_eq!(registry.count(Method::DELETE, "/blobs/uploads/"), 2);
    assert_eq!(registry.open_sessions(), 0);
}

#[tokio::test]
async fn test_copy_index_with_children() {
    let registry = FakeRegistry::new();
    let options = registry.options();
    let amd64 = image_with(b"amd64");
    let arm64 = image_with(b"arm64");
    let arm64_digest = arm64.digest().await.unwrap();
    let index = MemoryIndex::new(
        MediaType::DockerManifestList,
        vec![
            (Artifact::Image(Arc::new(amd64)), Some(Platform::new("linux", "amd64"))),
            (Artifact::Image(Arc::new(arm64)), Some(Platform::new("linux", "arm64"))),
        ],
    )
    .await
    .unwrap();
    remote::write_index(&reference("src/multi:v1"), Arc::new(index), &options)
        .await
        .unwrap();

    let stats = copy(&reference("src/multi:v1"), &reference("dst/multi:v1"), &options)
        .await
        .unwrap();
    assert_eq!(stats.manifests, 3);
    assert!(registry.manifest("dst/multi", &arm64_digest.to_string()).is_some());
    assert_eq!(
        registry.manifest("dst/multi", "v1"),
        registry.manifest("src/multi", "v1")
    );
}

#[tokio::test]
async fn test_recursive_copy_mirrors_tree() {
    let registry = FakeRegistry::new();
    registry.enable_extension();
    let options = registry.options();

    let base = image_with(b"base");
    remote::write(&reference("src/a:v1"), &base, &options).await.unwrap();
    remote::write(&reference("src/a:latest"), &base, &options).await.unwrap();
    let tool = image_with(b"tool");
    remote::write(&reference("src/a/b:v2"), &tool, &options).await.unwrap();
    let index = MemoryIndex::new(
        MediaType::OciImageIndex,
        vec![
            (Artifact::Image(Arc::new(image_with(b"x86"))), Some(Platform::new("linux", "amd64"))),
            (Artifact::Image(Arc::new(image_with(b"arm"))), Some(Platform::new("linux", "arm64"))),
        ],
    )
    .await
    .unwrap();
    remote::write_index(&reference("src/a/b:multi"), Arc::new(index), &options)
        .await
        .unwrap();
    // The destination already holds `base` as v1.
    remote::write(&reference("dst/a:v1"), &base, &options).await.unwrap();

    let stats = RecursiveCopier::new(options.clone())
        .with_backoff(Backoff::none())
        .run(&repository("src/a"), &repository("dst/a"))
        .await
        .unwrap();

    assert_eq!(stats.repositories, 2);
    // dst/a: retag `latest`. dst/a/b: two images, two index children, the index.
    assert_eq!(stats.tasks, 5);
    assert_eq!(stats.retagged, 1);
    assert_eq!(registry.tags("dst/a"), vec!["latest", "v1"]);
    assert_eq!(registry.tags("dst/a/b"), vec!["multi", "v2"]);
    assert_eq!(
        registry.manifest("dst/a/b", "multi"),
        registry.manifest("src/a/b", "multi")
    );

    // Nothing left to do on a second run.
    let again = RecursiveCopier::new(options)
        .with_backoff(Backoff::none())
        .run(&repository("src/a"), &repository("dst/a"))
        .await
        .unwrap();
    assert_eq!(again.tasks, 0);
}

#[tokio::test]
async fn test_recursive_copy_without_extension() {
    let registry = FakeRegistry::new();
    let options = registry.options();
    let image = image_with(b"plain registry");
    remote::write(&reference("src/app:v1"), &image, &options).await.unwrap();
    remote::write(&reference("src/app:v2"), &image, &options).await.unwrap();

    let stats = RecursiveCopier::new(options)
        .with_backoff(Backoff::none())
        .run(&repository("src/app"), &repository("mirror/app"))
        .await
        .unwrap();
    assert_eq!(stats.repositories, 1);
    assert_eq!(stats.tasks, 1);
    assert_eq!(stats.retagged, 1);
    assert_eq!(registry.tags("mirror/app"), vec!["v1", "v2"]);
}

#[tokio::test]
async fn test_recursive_copy_of_missing_root_fails() {
    let registry = FakeRegistry::new();
    let err = RecursiveCopier::new(registry.options())
        .with_backoff(Backoff::none())
        .run(&repository("nowhere"), &repository("dst"))
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found(), "unexpected error {:?}", err);
}

#[tokio::test]
async fn test_walk_visits_parents_first() {
    let registry = FakeRegistry::new();
    registry.enable_extension();
    let options = registry.options();
    for name in ["root/a:v1", "root/a/x:v1", "root/b:v1"] {
        remote::write(&reference(name), &image_with(name.as_bytes()), &options)
            .await
            .unwrap();
    }

    let mut visited = Vec::new();
    remote::walk(&repository("root"), &options, |repo, tags| {
        let tags = tags?;
        visited.push((repo.repository_str().to_string(), tags.tags.len()));
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(
        visited,
        vec![
            ("root".to_string(), 0),
            ("root/a".to_string(), 1),
            ("root/a/x".to_string(), 1),
            ("root/b".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn test_keychain_credentials_reach_token_endpoint() {
    let registry = FakeRegistry::new();
    remote::write(&reference("private/app:v1"), &image_with(b"secret"), &registry.options())
        .await
        .unwrap();
    registry.require_bearer("granted", &["granted"]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        format!(r#"{{"auths":{{"{}":{{"auth":"YWxpY2U6c2VjcmV0"}}}}}}"#, HOST),
    )
    .unwrap();
    let keychain = DefaultKeychain::builder().config_path(&path).build();
    let options = registry.options().with_keychain(Arc::new(keychain));

    remote::get(&reference("private/app:v1"), &options).await.unwrap();
    assert_eq!(registry.token_credentials(), vec!["Basic YWxpY2U6c2VjcmV0"]);
}
