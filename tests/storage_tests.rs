//! Tests for the volume store and the image store, driven through a
//! local executor over temp directories.

use pocketlinx::container::ImageMetadata;
use pocketlinx::error::Error;
use pocketlinx::executor::LocalExecutor;
use pocketlinx::images::ImageStore;
use pocketlinx::volumes::VolumeStore;
use pocketlinx::{PathMapper, PathStyle};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn volumes(dir: &TempDir) -> VolumeStore {
    VolumeStore::new(
        Arc::new(LocalExecutor::new()),
        dir.path().join("volumes").to_string_lossy().into_owned(),
    )
}

fn images(dir: &TempDir) -> ImageStore {
    ImageStore::new(
        Arc::new(LocalExecutor::new()),
        PathMapper::new(PathStyle::Identity),
        dir.path().join("images").to_string_lossy().into_owned(),
    )
}

/// Packs `files` (name → contents) into `<images>/<name>.tar.gz`.
fn make_image(dir: &TempDir, name: &str, files: &[(&str, &str)]) {
    let staging = dir.path().join(format!("staging-{name}"));
    for (path, contents) in files {
        let full = staging.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }
    let images_dir = dir.path().join("images");
    std::fs::create_dir_all(&images_dir).unwrap();
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!(
            "tar -C '{}' -czf '{}/{}.tar.gz' .",
            staging.display(),
            images_dir.display(),
            name
        ))
        .status()
        .unwrap();
    assert!(status.success());
}

// =============================================================================
// Volumes
// =============================================================================

#[tokio::test]
async fn test_volume_create_list_remove_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = volumes(&dir);

    let before = store.list().await.unwrap();
    store.create("data").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["data".to_string()]);

    store.remove("data").await.unwrap();
    // create + rm leaves the volumes directory as it was
    assert_eq!(store.list().await.unwrap(), before);
}

#[tokio::test]
async fn test_volume_create_twice_fails() {
    let dir = TempDir::new().unwrap();
    let store = volumes(&dir);
    store.create("data").await.unwrap();
    assert!(matches!(
        store.create("data").await,
        Err(Error::AlreadyExists { .. })
    ));
}

#[tokio::test]
async fn test_volume_remove_absent_fails() {
    let dir = TempDir::new().unwrap();
    let store = volumes(&dir);
    assert!(matches!(
        store.remove("ghost").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_volume_ensure_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = volumes(&dir);
    let p1 = store.ensure("auto").await.unwrap();
    let p2 = store.ensure("auto").await.unwrap();
    assert_eq!(p1, p2);
    assert_eq!(store.list().await.unwrap(), vec!["auto".to_string()]);
}

#[tokio::test]
async fn test_volume_bad_name_rejected() {
    let dir = TempDir::new().unwrap();
    let store = volumes(&dir);
    assert!(store.create("../escape").await.is_err());
    assert!(store.create("has space").await.is_err());
}

// =============================================================================
// Images
// =============================================================================

#[tokio::test]
async fn test_image_list_alphabetical() {
    let dir = TempDir::new().unwrap();
    make_image(&dir, "zeta", &[("f", "x")]);
    make_image(&dir, "alpha", &[("f", "x")]);
    let store = images(&dir);
    assert_eq!(
        store.list().await.unwrap(),
        vec!["alpha".to_string(), "zeta".to_string()]
    );
}

#[tokio::test]
async fn test_image_metadata_sidecar_roundtrip() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("images")).unwrap();
    let store = images(&dir);

    let meta = ImageMetadata {
        user: "app".to_string(),
        workdir: "/srv".to_string(),
        env: HashMap::from([("PORT".to_string(), "8000".to_string())]),
        command: vec!["sh".to_string(), "-c".to_string(), "serve".to_string()],
    };
    store.save_metadata("web", &meta).await.unwrap();

    let loaded = store.load_metadata("web").await;
    assert_eq!(loaded.user, "app");
    assert_eq!(loaded.workdir, "/srv");
    assert_eq!(loaded.env["PORT"], "8000");
    assert_eq!(loaded.command, meta.command);
}

#[tokio::test]
async fn test_missing_sidecar_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let store = images(&dir);
    let meta = store.load_metadata("nothing").await;
    assert!(meta.user.is_empty());
    assert!(meta.command.is_empty());
}

#[tokio::test]
async fn test_pull_rejects_unknown_image() {
    let dir = TempDir::new().unwrap();
    let store = images(&dir);
    assert!(matches!(
        store.pull("not-on-the-allowlist").await,
        Err(Error::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_diff_reports_added_and_removed() {
    let dir = TempDir::new().unwrap();
    make_image(&dir, "base", &[("bin/sh", "sh"), ("etc/old", "x")]);
    make_image(
        &dir,
        "target",
        &[("bin/sh", "sh"), ("opt/app/run", "binary")],
    );
    let store = images(&dir);

    let text = store.diff("base", "target").await.unwrap();
    assert!(text.contains("+ ./opt/app/run"));
    assert!(text.contains("- ./etc/old"));
}

#[tokio::test]
async fn test_diff_missing_image_is_not_found() {
    let dir = TempDir::new().unwrap();
    make_image(&dir, "base", &[("f", "x")]);
    let store = images(&dir);
    assert!(matches!(
        store.diff("base", "ghost").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_export_diff_contains_exactly_the_delta() {
    let dir = TempDir::new().unwrap();
    make_image(&dir, "base", &[("bin/sh", "sh")]);
    make_image(
        &dir,
        "target",
        &[("bin/sh", "sh"), ("opt/app/run", "binary"), ("opt/app/cfg", "c")],
    );
    let store = images(&dir);

    let out = dir.path().join("delta.tgz");
    store
        .export_diff("base", "target", &out.to_string_lossy())
        .await
        .unwrap();
    assert!(out.exists());

    let listing = std::process::Command::new("tar")
        .args(["-ztf", &out.to_string_lossy()])
        .output()
        .unwrap();
    let names: Vec<&str> = std::str::from_utf8(&listing.stdout)
        .unwrap()
        .lines()
        .filter(|l| l.ends_with("run") || l.ends_with("cfg") || l.ends_with("sh"))
        .collect();

    // Exactly the files of target \ base, never the shared ones.
    assert!(names.iter().any(|n| n.contains("opt/app/run")));
    assert!(names.iter().any(|n| n.contains("opt/app/cfg")));
    assert!(!names.iter().any(|n| n.contains("bin/sh")));
}

#[tokio::test]
async fn test_export_diff_identical_images_fails() {
    let dir = TempDir::new().unwrap();
    make_image(&dir, "base", &[("f", "x")]);
    make_image(&dir, "copy", &[("f", "x")]);
    let store = images(&dir);

    let out = dir.path().join("delta.tgz");
    let result = store.export_diff("base", "copy", &out.to_string_lossy()).await;
    assert!(matches!(result, Err(Error::NoDifference { .. })));
    assert!(!out.exists(), "no partial archive on failure");
}
