//! # Build Layer Cache
//!
//! Content-addressed cache of full-rootfs snapshots, keyed by a chained
//! SHA-256 over the instruction list.
//!
//! ## Hash Chain
//!
//! ```text
//! parent₀ = sha256("FROM " + base_image)
//! hashᵢ   = sha256(parentᵢ || type || raw_args [|| copy_source_hash])
//! parentᵢ₊₁ = hashᵢ
//! ```
//!
//! For `COPY` steps the source tree is hashed too (relative path,
//! dir-flag, and file bytes per entry, in sorted order), so editing a
//! copied file invalidates that step and everything after it — and
//! nothing before it. `.plxignore` entries and the literal `.git` are
//! excluded from traversal, matching what `COPY` actually transfers.
//!
//! ## Storage
//!
//! Layers are gzipped tars of the whole build rootfs, stored inside the
//! executor under the cache directory as `<hash>.tar.gz`. A layer file
//! exists iff its snapshot completed; a torn write fails the `test -f`
//! + extract on the next build and is simply treated as a miss.

use crate::constants::BUILD_IGNORE_FILE;
use crate::dockerfile::{Dockerfile, Instruction, InstructionKind};
use crate::error::{Error, Result};
use crate::executor::Executor;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Hashing
// =============================================================================

/// Computes the initial parent hash for a base image.
pub fn base_hash(base_image: &str) -> String {
    hex::encode(Sha256::digest(format!("FROM {}", base_image)))
}

/// Computes one step hash from its parent.
///
/// `ctx_dir` is only consulted for `COPY`/`ADD` steps, whose source
/// bytes feed the hash.
pub fn instruction_hash(parent: &str, instr: &Instruction, ctx_dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(instr.kind.as_str().as_bytes());
    hasher.update(instr.raw.as_bytes());

    if matches!(instr.kind, InstructionKind::Copy | InstructionKind::Add)
        && instr.args.len() >= 2
    {
        let src = ctx_dir.join(&instr.args[0]);
        let ignores = load_ignore_patterns(ctx_dir);
        let tree = hash_tree(&src, &ignores).map_err(|e| {
            Error::InvalidArgument(format!(
                "cannot hash {} source {}: {}",
                instr.kind,
                src.display(),
                e
            ))
        })?;
        hasher.update(tree.as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Computes the full step-hash chain for a Dockerfile.
pub fn step_hashes(df: &Dockerfile, ctx_dir: &Path) -> Result<Vec<String>> {
    let mut parent = base_hash(&df.base);
    let mut hashes = Vec::with_capacity(df.instructions.len());
    for instr in &df.instructions {
        let h = instruction_hash(&parent, instr, ctx_dir)?;
        hashes.push(h.clone());
        parent = h;
    }
    Ok(hashes)
}

/// Reads `.plxignore` from the context dir; `.git` is always ignored.
pub fn load_ignore_patterns(ctx_dir: &Path) -> HashSet<String> {
    let mut patterns = HashSet::new();
    if let Ok(text) = std::fs::read_to_string(ctx_dir.join(BUILD_IGNORE_FILE)) {
        for line in text.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                patterns.insert(line.to_string());
            }
        }
    }
    patterns.insert(".git".to_string());
    patterns
}

/// Hashes a file or directory tree deterministically.
///
/// Entries are visited in sorted order; each contributes
/// `rel_path|is_dir|` and, for files, the raw contents. Entries whose
/// relative path or base name matches an ignore pattern are skipped
/// (whole subtree for directories).
fn hash_tree(root: &Path, ignores: &HashSet<String>) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    walk_sorted(root, root, ignores, &mut |rel, path, is_dir| {
        hasher.update(rel.as_bytes());
        hasher.update(b"|");
        hasher.update(if is_dir { b"true|" as &[u8] } else { b"false|" });
        if !is_dir {
            hasher.update(std::fs::read(path)?);
        }
        Ok(())
    })?;
    Ok(hex::encode(hasher.finalize()))
}

fn walk_sorted(
    root: &Path,
    dir: &Path,
    ignores: &HashSet<String>,
    visit: &mut dyn FnMut(&str, &Path, bool) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let rel = relative_of(root, dir);
    if is_ignored(&rel, dir, ignores) {
        return Ok(());
    }
    let meta = std::fs::metadata(dir)?;
    if !rel.is_empty() || dir == root {
        visit(if rel.is_empty() { "." } else { &rel }, dir, meta.is_dir())?;
    }
    if !meta.is_dir() {
        return Ok(());
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = relative_of(root, &path);
        if is_ignored(&rel, &path, ignores) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            walk_sorted(root, &path, ignores, visit)?;
        } else {
            visit(&rel, &path, false)?;
        }
    }
    Ok(())
}

fn relative_of(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn is_ignored(rel: &str, path: &Path, ignores: &HashSet<String>) -> bool {
    if rel.is_empty() || rel == "." {
        return false;
    }
    if ignores.contains(rel) {
        return true;
    }
    path.file_name()
        .map(|n| ignores.contains(&n.to_string_lossy().to_string()))
        .unwrap_or(false)
}

// =============================================================================
// Layer Cache
// =============================================================================

/// Snapshot store for build layers, living inside the executor.
pub struct LayerCache {
    executor: Arc<dyn Executor>,
    cache_dir: String,
}

impl LayerCache {
    /// Creates a cache over the given executor-side directory.
    pub fn new(executor: Arc<dyn Executor>, cache_dir: impl Into<String>) -> Self {
        Self {
            executor,
            cache_dir: cache_dir.into(),
        }
    }

    /// Executor-side path of a layer file.
    pub fn layer_path(&self, hash: &str) -> String {
        format!("{}/{}.tar.gz", self.cache_dir, hash)
    }

    /// Checks whether a layer snapshot exists.
    pub async fn has_layer(&self, hash: &str) -> bool {
        self.executor
            .succeeds(&["test", "-f", &self.layer_path(hash)])
            .await
    }

    /// Snapshots `rootfs` into the cache under `hash`.
    ///
    /// The tar→gzip pipe runs entirely inside the executor; piping the
    /// bytes through the host would re-introduce CRLF corruption on
    /// Windows.
    pub async fn save(&self, hash: &str, rootfs: &str) -> Result<()> {
        self.executor
            .run(&["mkdir", "-p", &self.cache_dir])
            .await?;
        let script = format!(
            "tar -C '{}' -cf - . | gzip > '{}'",
            rootfs,
            self.layer_path(hash)
        );
        debug!(hash = &hash[..12.min(hash.len())], "saving layer");
        self.executor.shell(&script).await
    }

    /// Restores a cached layer into `rootfs` (wipe, then extract).
    ///
    /// Layers are full snapshots, so the target must be emptied first
    /// or ghost files from a previous step would survive.
    pub async fn restore(&self, hash: &str, rootfs: &str) -> Result<()> {
        info!(hash = &hash[..12.min(hash.len())], "restoring layer");
        self.executor
            .shell(&format!("rm -rf {}/* {}/.[!.]* 2>/dev/null || true", rootfs, rootfs))
            .await?;
        self.executor
            .run(&["tar", "-xzf", &self.layer_path(hash), "-C", rootfs])
            .await
    }

    /// Removes every cached layer.
    pub async fn prune(&self) -> Result<()> {
        info!("pruning build cache");
        self.executor
            .shell(&format!("rm -rf {}/*", self.cache_dir))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::Dockerfile;
    use tempfile::TempDir;

    fn df(text: &str) -> Dockerfile {
        Dockerfile::parse(text).unwrap()
    }

    #[test]
    fn test_base_hash_is_deterministic() {
        assert_eq!(base_hash("alpine"), base_hash("alpine"));
        assert_ne!(base_hash("alpine"), base_hash("ubuntu"));
    }

    #[test]
    fn test_chain_depends_only_on_prefix() {
        let ctx = TempDir::new().unwrap();
        let a = step_hashes(&df("FROM alpine\nRUN echo one\nRUN echo two\n"), ctx.path()).unwrap();
        let b = step_hashes(&df("FROM alpine\nRUN echo one\nRUN echo two\n"), ctx.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_changing_step_invalidates_suffix_only() {
        let ctx = TempDir::new().unwrap();
        let orig = step_hashes(
            &df("FROM alpine\nRUN echo one\nRUN echo two\nRUN echo three\n"),
            ctx.path(),
        )
        .unwrap();
        let edited = step_hashes(
            &df("FROM alpine\nRUN echo one\nRUN echo CHANGED\nRUN echo three\n"),
            ctx.path(),
        )
        .unwrap();

        assert_eq!(orig[0], edited[0], "steps before the edit keep their hash");
        assert_ne!(orig[1], edited[1]);
        assert_ne!(orig[2], edited[2], "steps after the edit are invalidated");
    }

    #[test]
    fn test_changing_base_invalidates_everything() {
        let ctx = TempDir::new().unwrap();
        let a = step_hashes(&df("FROM alpine\nRUN echo hi\n"), ctx.path()).unwrap();
        let b = step_hashes(&df("FROM ubuntu\nRUN echo hi\n"), ctx.path()).unwrap();
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn test_copy_hash_tracks_source_bytes() {
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("x"), "v1").unwrap();
        let text = "FROM alpine\nCOPY ./x /x\n";

        let first = step_hashes(&df(text), ctx.path()).unwrap();
        std::fs::write(ctx.path().join("x"), "v2").unwrap();
        let second = step_hashes(&df(text), ctx.path()).unwrap();

        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn test_copy_hash_ignores_plxignore_entries() {
        let ctx = TempDir::new().unwrap();
        let src = ctx.path().join("app");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(ctx.path().join(".plxignore"), "app/scratch\n").unwrap();
        let text = "FROM alpine\nCOPY ./app /app\n";

        let before = step_hashes(&df(text), ctx.path()).unwrap();
        std::fs::write(src.join("scratch"), "noise").unwrap();
        let after = step_hashes(&df(text), ctx.path()).unwrap();

        assert_eq!(before[0], after[0], "ignored entries must not affect the hash");
    }

    #[test]
    fn test_git_dir_always_ignored() {
        let ctx = TempDir::new().unwrap();
        let src = ctx.path().join("app");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        let text = "FROM alpine\nCOPY ./app /app\n";

        let before = step_hashes(&df(text), ctx.path()).unwrap();
        std::fs::create_dir(src.join(".git")).unwrap();
        std::fs::write(src.join(".git").join("HEAD"), "ref: main").unwrap();
        let after = step_hashes(&df(text), ctx.path()).unwrap();

        assert_eq!(before[0], after[0]);
    }

    #[test]
    fn test_copy_hash_missing_source_errors() {
        let ctx = TempDir::new().unwrap();
        let result = step_hashes(&df("FROM alpine\nCOPY ./nope /x\n"), ctx.path());
        assert!(result.is_err());
    }
}
