//! # Image Store
//!
//! Persists images as plain gzipped root-filesystem tarballs under the
//! executor-side images directory, each with an optional JSON metadata
//! sidecar (`<name>.json`). No manifests, no layers inside the tar —
//! an image is exactly one archive (spec'd non-goal: OCI formats).
//!
//! Downloads happen *inside* the executor (`wget || curl`), so the host
//! process never needs an HTTP client and the bytes land directly where
//! builds and runs consume them.

use crate::constants::{DIFF_LIST_CAP, image_url};
use crate::container::ImageMetadata;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::pathmap::PathMapper;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Entry-Set Helpers
// =============================================================================

/// Splits two sorted-deduped entry lists into `(added, removed)`.
///
/// `added` = entries only in `target`; `removed` = entries only in
/// `base`. Output is sorted, so diff text is stable across runs.
pub fn diff_entry_sets(base: &[String], target: &[String]) -> (Vec<String>, Vec<String>) {
    let base_set: BTreeSet<&str> = base.iter().map(String::as_str).collect();
    let target_set: BTreeSet<&str> = target.iter().map(String::as_str).collect();

    let added = target_set
        .difference(&base_set)
        .map(|s| s.to_string())
        .collect();
    let removed = base_set
        .difference(&target_set)
        .map(|s| s.to_string())
        .collect();
    (added, removed)
}

/// Renders the human-readable diff listing, capped per section.
pub fn format_diff(a: &str, b: &str, added: &[String], removed: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Image Diff: {} -> {}\n", a, b));
    out.push_str(&format!("{}\n", "-".repeat(40)));

    if !added.is_empty() {
        out.push_str(&format!("ADDED ({} files):\n", added.len()));
        for (i, f) in added.iter().enumerate() {
            if i >= DIFF_LIST_CAP {
                out.push_str("  ...\n");
                break;
            }
            out.push_str(&format!("  + {}\n", f));
        }
    }

    if !removed.is_empty() {
        out.push_str(&format!("\nREMOVED ({} files):\n", removed.len()));
        for (i, f) in removed.iter().enumerate() {
            if i >= DIFF_LIST_CAP {
                out.push_str("  ...\n");
                break;
            }
            out.push_str(&format!("  - {}\n", f));
        }
    }

    if added.is_empty() && removed.is_empty() {
        out.push_str("No changes detected (identical file lists).\n");
    }

    out
}

// =============================================================================
// Image Store
// =============================================================================

/// Tarball + sidecar persistence for images.
pub struct ImageStore {
    executor: Arc<dyn Executor>,
    mapper: PathMapper,
    images_dir: String,
}

impl ImageStore {
    /// Creates a store over the executor-side images directory.
    pub fn new(
        executor: Arc<dyn Executor>,
        mapper: PathMapper,
        images_dir: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            mapper,
            images_dir: images_dir.into(),
        }
    }

    /// Executor-side path of an image tarball.
    pub fn tarball_path(&self, name: &str) -> String {
        format!("{}/{}.tar.gz", self.images_dir, name)
    }

    /// Executor-side path of an image metadata sidecar.
    pub fn metadata_path(&self, name: &str) -> String {
        format!("{}/{}.json", self.images_dir, name)
    }

    /// Checks whether the image tarball exists.
    pub async fn exists(&self, name: &str) -> bool {
        self.executor
            .succeeds(&["test", "-f", &self.tarball_path(name)])
            .await
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Ensures an image tarball exists, downloading it if necessary.
    ///
    /// Only allow-listed names are accepted. A second `pull` of a
    /// present image is a no-op (no re-download).
    pub async fn pull(&self, name: &str) -> Result<()> {
        let url = image_url(name).ok_or_else(|| Error::Unsupported(name.to_string()))?;

        self.executor
            .run(&["mkdir", "-p", &self.images_dir])
            .await?;

        let target = self.tarball_path(name);
        if self.executor.succeeds(&["test", "-f", &target]).await {
            info!(image = name, "image already exists");
            return Ok(());
        }

        info!(image = name, url, "pulling image inside executor");
        // wget first, curl as fallback; partial files are removed so a
        // failed download never looks like a present image.
        let script = format!(
            "(wget -O '{t}' '{u}' || curl -fL -o '{t}' '{u}') || {{ rm -f '{t}'; exit 1; }}",
            t = target,
            u = url
        );
        self.executor.shell(&script).await.map_err(|e| {
            Error::Internal(format!("download of image '{}' failed: {}", name, e))
        })
    }

    // =========================================================================
    // List
    // =========================================================================

    /// Lists image names, alphabetically.
    pub async fn list(&self) -> Result<Vec<String>> {
        let script = format!("ls {}/*.tar.gz 2>/dev/null || true", self.images_dir);
        let out = self.executor.shell_output(&script).await.unwrap_or_default();

        let mut names: Vec<String> = out
            .lines()
            .filter_map(|l| {
                let base = l.trim().rsplit('/').next()?;
                base.strip_suffix(".tar.gz").map(str::to_string)
            })
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Metadata Sidecar
    // =========================================================================

    /// Loads an image's metadata sidecar; absence yields all-empty
    /// defaults.
    pub async fn load_metadata(&self, name: &str) -> ImageMetadata {
        match self
            .executor
            .output(&["cat", &self.metadata_path(name)])
            .await
        {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => ImageMetadata::default(),
        }
    }

    /// Writes an image's metadata sidecar.
    pub async fn save_metadata(&self, name: &str, meta: &ImageMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        let script = format!("cat > '{}'", self.metadata_path(name));
        self.executor
            .run_with_input(&json, &["sh", "-c", &script])
            .await
    }

    // =========================================================================
    // Diff
    // =========================================================================

    /// Lists the tar entry names of an image.
    pub async fn tar_entries(&self, name: &str) -> Result<Vec<String>> {
        let path = self.tarball_path(name);
        if !self.executor.succeeds(&["test", "-f", &path]).await {
            return Err(Error::image_not_found(name));
        }
        let out = self.executor.output(&["tar", "-ztf", &path]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Human-readable added/removed listing between two images.
    pub async fn diff(&self, a: &str, b: &str) -> Result<String> {
        let entries_a = self.tar_entries(a).await?;
        let entries_b = self.tar_entries(b).await?;
        let (added, removed) = diff_entry_sets(&entries_a, &entries_b);
        Ok(format_diff(a, b, &added, &removed))
    }

    // =========================================================================
    // Export Diff
    // =========================================================================

    /// Produces a gzipped tar of exactly the entries present in
    /// `target` but not in `base`, written to the *host* path
    /// `out_path`.
    ///
    /// The delta is assembled in an executor-side temp workspace and
    /// copied out in one step, so the caller never observes a partial
    /// archive at `out_path`.
    pub async fn export_diff(&self, base: &str, target: &str, out_path: &str) -> Result<()> {
        let entries_base = self.tar_entries(base).await?;
        let entries_target = self.tar_entries(target).await?;
        let (added, _) = diff_entry_sets(&entries_base, &entries_target);

        if added.is_empty() {
            return Err(Error::NoDifference {
                base: base.to_string(),
                target: target.to_string(),
            });
        }

        info!(count = added.len(), base, target, "packaging image delta");

        let token = uuid::Uuid::now_v7().simple().to_string();
        let workspace = format!("/tmp/plx-export-{}", token);
        let file_list = format!("{}/files.txt", workspace);
        let delta_tar = format!("{}/delta.tar.gz", workspace);

        let result = self
            .export_into_workspace(target, &added, &workspace, &file_list, &delta_tar, out_path)
            .await;

        // Workspace cleanup is unconditional.
        let _ = self
            .executor
            .run(&["rm", "-rf", &workspace])
            .await;

        result
    }

    async fn export_into_workspace(
        &self,
        target: &str,
        added: &[String],
        workspace: &str,
        file_list: &str,
        delta_tar: &str,
        out_path: &str,
    ) -> Result<()> {
        self.executor
            .run(&["mkdir", "-p", &format!("{}/extract", workspace)])
            .await?;

        let list = added.join("\n");
        self.executor
            .run_with_input(&list, &["sh", "-c", &format!("cat > {}", file_list)])
            .await?;

        debug!("extracting delta entries");
        self.executor
            .shell(&format!(
                "tar -C {ws}/extract -xzf '{tar}' -T {list}",
                ws = workspace,
                tar = self.tarball_path(target),
                list = file_list
            ))
            .await?;

        debug!("compressing delta package");
        self.executor
            .shell(&format!(
                "tar -C {ws}/extract -czf {delta} .",
                ws = workspace,
                delta = delta_tar
            ))
            .await?;

        let host_visible = self
            .mapper
            .absolutize_to_executor(std::path::Path::new(out_path))?;
        self.executor
            .run(&["cp", delta_tar, &host_visible])
            .await?;

        info!(out = out_path, "exported build package");
        Ok(())
    }
}
