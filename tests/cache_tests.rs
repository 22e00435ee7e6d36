//! Tests for the build hash chain and layer cache.
//!
//! The hash-chain properties here are the contract the fast-forward
//! logic depends on: determinism, prefix-stability, and suffix
//! invalidation.

use pocketlinx::cache::{LayerCache, base_hash, step_hashes};
use pocketlinx::dockerfile::Dockerfile;
use pocketlinx::executor::LocalExecutor;
use std::sync::Arc;
use tempfile::TempDir;

fn parse(text: &str) -> Dockerfile {
    Dockerfile::parse(text).unwrap()
}

// =============================================================================
// Hash Chain
// =============================================================================

#[test]
fn test_hashes_are_hex_sha256() {
    let ctx = TempDir::new().unwrap();
    let hashes = step_hashes(&parse("FROM alpine\nRUN true\n"), ctx.path()).unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].len(), 64);
    assert!(hashes[0].chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_base_hash_seeds_chain() {
    // Two Dockerfiles with identical steps but different bases share
    // no hashes at all.
    let ctx = TempDir::new().unwrap();
    let a = step_hashes(&parse("FROM alpine\nRUN true\nRUN false\n"), ctx.path()).unwrap();
    let b = step_hashes(&parse("FROM ubuntu\nRUN true\nRUN false\n"), ctx.path()).unwrap();
    assert!(a.iter().zip(&b).all(|(x, y)| x != y));
    assert_ne!(base_hash("alpine"), base_hash("ubuntu"));
}

#[test]
fn test_hash_depends_on_instruction_type() {
    // Same raw args under a different instruction type must hash
    // differently.
    let ctx = TempDir::new().unwrap();
    let run = step_hashes(&parse("FROM alpine\nRUN echo x\n"), ctx.path()).unwrap();
    let unknown = step_hashes(&parse("FROM alpine\nONBUILD echo x\n"), ctx.path()).unwrap();
    assert_ne!(run[0], unknown[0]);
}

#[test]
fn test_editing_copy_source_invalidates_downstream() {
    // Changing COPY source bytes re-keys that step and all following
    // steps, leaving earlier ones untouched.
    let ctx = TempDir::new().unwrap();
    std::fs::write(ctx.path().join("x"), "one").unwrap();
    let text = "FROM alpine\nRUN echo one > /a\nCOPY ./x /x\nRUN echo two >> /a\n";

    let first = step_hashes(&parse(text), ctx.path()).unwrap();
    std::fs::write(ctx.path().join("x"), "two").unwrap();
    let second = step_hashes(&parse(text), ctx.path()).unwrap();

    assert_eq!(first[0], second[0], "step before COPY unaffected");
    assert_ne!(first[1], second[1], "COPY step re-keyed");
    assert_ne!(first[2], second[2], "step after COPY re-keyed");
}

#[test]
fn test_copy_rename_changes_hash() {
    let ctx = TempDir::new().unwrap();
    let src = ctx.path().join("app");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("a.txt"), "same bytes").unwrap();
    let text = "FROM alpine\nCOPY ./app /app\n";

    let before = step_hashes(&parse(text), ctx.path()).unwrap();
    std::fs::rename(src.join("a.txt"), src.join("b.txt")).unwrap();
    let after = step_hashes(&parse(text), ctx.path()).unwrap();

    // Relative paths are part of the tree hash, not just contents.
    assert_ne!(before[0], after[0]);
}

// =============================================================================
// Layer Cache (local executor)
// =============================================================================

#[tokio::test]
async fn test_layer_cache_roundtrip() {
    let dirs = TempDir::new().unwrap();
    let cache_dir = dirs.path().join("cache");
    let rootfs = dirs.path().join("rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();
    std::fs::write(rootfs.join("hello.txt"), "payload").unwrap();

    let cache = LayerCache::new(
        Arc::new(LocalExecutor::new()),
        cache_dir.to_string_lossy().into_owned(),
    );
    let hash = "a".repeat(64);

    assert!(!cache.has_layer(&hash).await);
    cache
        .save(&hash, &rootfs.to_string_lossy())
        .await
        .unwrap();
    assert!(cache.has_layer(&hash).await);

    // Restore into a dirty rootfs: stale files must vanish.
    std::fs::write(rootfs.join("stale.txt"), "ghost").unwrap();
    std::fs::remove_file(rootfs.join("hello.txt")).unwrap();
    cache
        .restore(&hash, &rootfs.to_string_lossy())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(rootfs.join("hello.txt")).unwrap(),
        "payload"
    );
    assert!(!rootfs.join("stale.txt").exists());
}

#[tokio::test]
async fn test_prune_empties_cache() {
    let dirs = TempDir::new().unwrap();
    let cache_dir = dirs.path().join("cache");
    let rootfs = dirs.path().join("rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();
    std::fs::write(rootfs.join("f"), "x").unwrap();

    let cache = LayerCache::new(
        Arc::new(LocalExecutor::new()),
        cache_dir.to_string_lossy().into_owned(),
    );
    let hash = "b".repeat(64);
    cache.save(&hash, &rootfs.to_string_lossy()).await.unwrap();
    assert!(cache.has_layer(&hash).await);

    cache.prune().await.unwrap();
    assert!(!cache.has_layer(&hash).await);
}
