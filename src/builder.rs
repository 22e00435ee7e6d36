//! # Build Engine
//!
//! Executes a parsed Dockerfile against a chroot'd build rootfs inside
//! the executor, with content-addressed checkpointing.
//!
//! ## Fast-Forward and the Shortcut
//!
//! Before executing anything, step hashes are scanned from last to
//! first; the highest index with a cached layer is `last_hit`.
//!
//! - `last_hit == N-1`: the whole Dockerfile is cached. The final layer
//!   file is copied straight to the image path and no step runs
//!   ("Shortcut").
//! - `last_hit >= 0`: that layer is restored into a fresh build rootfs
//!   and execution resumes at `last_hit + 1`.
//! - no hit: the base image is extracted and every step runs.
//!
//! Even cached steps are *walked* (not executed) so the cumulative
//! `ENV`/`WORKDIR`/`USER` state is correct for the steps that do run
//! and for the final image metadata.
//!
//! ## RUN Sandbox
//!
//! Each `RUN` writes a `set -e` script into the rootfs, then — in a
//! mount-unshared shell — binds proc/sysfs, creates the basic device
//! nodes, injects the host's `resolv.conf`, and chroots into the rootfs
//! to execute it (via `su <user> -c` when a `USER` is active).
//! proc/sysfs are unmounted on the way out regardless of the outcome.
//!
//! ## Failure Semantics
//!
//! A failed step aborts the build with [`Error::BuildStepFailed`]; the
//! transient build directory is removed unconditionally. Cache layers
//! are append-only: a torn layer write fails `test -f`-then-extract on
//! the next build and counts as a miss.

use crate::cache::{LayerCache, load_ignore_patterns, step_hashes};
use crate::container::ImageMetadata;
use crate::dockerfile::{Dockerfile, Instruction, InstructionKind};
use crate::error::{Error, Result};
use crate::executor::{Executor, run_with_progress};
use crate::images::ImageStore;
use crate::pathmap::PathMapper;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Joins path segments the way the shim-side shell expects:
/// single separators, no trailing slash (except root).
fn clean_join(a: &str, b: &str) -> String {
    let joined = format!("{}/{}", a.trim_end_matches('/'), b.trim_start_matches('/'));
    let mut out = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() { "/".to_string() } else { out }
}

/// Cumulative instruction-walk state (also the final image metadata).
#[derive(Debug, Default)]
struct BuildState {
    env: HashMap<String, String>,
    env_prefix: String,
    workdir: String,
    user: String,
}

impl BuildState {
    fn new() -> Self {
        Self {
            workdir: "/".to_string(),
            user: "root".to_string(),
            ..Default::default()
        }
    }

    /// Folds an instruction into the cumulative state. Runs for every
    /// step, cached or not.
    fn absorb(&mut self, instr: &Instruction) {
        match instr.kind {
            InstructionKind::Env => {
                if instr.args.len() >= 2 {
                    let (k, v) = (&instr.args[0], &instr.args[1]);
                    self.env.insert(k.clone(), v.clone());
                    self.env_prefix
                        .push_str(&format!("export {}={:?}; ", k, v));
                }
            }
            InstructionKind::Workdir => {
                if let Some(dir) = instr.args.first() {
                    self.workdir = dir.clone();
                }
            }
            InstructionKind::User => {
                if let Some(user) = instr.args.first() {
                    self.user = user.clone();
                }
            }
            _ => {}
        }
    }
}

/// Content-addressed Dockerfile build executor.
pub struct BuildEngine {
    executor: Arc<dyn Executor>,
    mapper: PathMapper,
    images: Arc<ImageStore>,
    cache: Arc<LayerCache>,
    builds_dir: String,
}

impl BuildEngine {
    pub fn new(
        executor: Arc<dyn Executor>,
        mapper: PathMapper,
        images: Arc<ImageStore>,
        cache: Arc<LayerCache>,
        builds_dir: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            mapper,
            images,
            cache,
            builds_dir: builds_dir.into(),
        }
    }

    /// Builds `ctx_dir`/`dockerfile` into image `tag`.
    ///
    /// `dockerfile` defaults to `Dockerfile`; an empty `tag` falls back
    /// to the lowercased context directory name. Returns the image
    /// name.
    pub async fn build(&self, ctx_dir: &Path, dockerfile: &str, tag: &str) -> Result<String> {
        let dockerfile = if dockerfile.is_empty() { "Dockerfile" } else { dockerfile };
        let df = Dockerfile::parse_file(&ctx_dir.join(dockerfile))?;

        let hashes = step_hashes(&df, ctx_dir)?;
        let last_hit = self.find_last_hit(&hashes).await;

        let image_name = if tag.is_empty() {
            let abs = std::path::absolute(ctx_dir).unwrap_or_else(|_| ctx_dir.to_path_buf());
            abs.file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "image".to_string())
        } else {
            tag.to_string()
        };
        info!(image = %image_name, base = %df.base, "building image");

        let build_id = format!("build-{}", uuid::Uuid::now_v7().simple());
        let build_dir = format!("{}/{}", self.builds_dir, build_id);
        let rootfs = format!("{}/rootfs", build_dir);
        self.executor.run(&["mkdir", "-p", &rootfs]).await?;

        let result = self
            .build_in_dir(&df, ctx_dir, &hashes, last_hit, &rootfs, &image_name)
            .await;

        // The transient build directory is removed no matter what.
        let _ = self.executor.run(&["rm", "-rf", &build_dir]).await;

        result?;
        info!(image = %image_name, "successfully built image");
        Ok(image_name)
    }

    /// Scans step hashes from last to first for the deepest cache hit.
    async fn find_last_hit(&self, hashes: &[String]) -> Option<usize> {
        for i in (0..hashes.len()).rev() {
            if self.cache.has_layer(&hashes[i]).await {
                return Some(i);
            }
        }
        None
    }

    async fn build_in_dir(
        &self,
        df: &Dockerfile,
        ctx_dir: &Path,
        hashes: &[String],
        last_hit: Option<usize>,
        rootfs: &str,
        image_name: &str,
    ) -> Result<()> {
        let total = df.instructions.len();
        let shortcut = matches!(last_hit, Some(hit) if hit + 1 == total && total > 0);

        // Initialize the rootfs (skipped entirely on the shortcut path).
        if shortcut {
            info!("entire Dockerfile hit cache; taking build shortcut");
        } else if let Some(hit) = last_hit {
            info!(step = hit + 1, "resuming from cached layer");
            self.cache.restore(&hashes[hit], rootfs).await?;
        } else {
            self.extract_base(&df.base, rootfs).await?;
        }

        // Walk all instructions; execute only those past the hit.
        let mut state = BuildState::new();
        for (i, instr) in df.instructions.iter().enumerate() {
            state.absorb(instr);

            if shortcut || matches!(last_hit, Some(hit) if i <= hit) {
                continue;
            }

            info!("[{}/{}] {} {}", i + 1, total, instr.kind, instr.raw);
            match instr.kind {
                InstructionKind::Run => {
                    self.execute_run(i, instr, rootfs, &state).await?;
                }
                InstructionKind::Copy | InstructionKind::Add => {
                    self.execute_copy(i, instr, ctx_dir, rootfs, &state.workdir)
                        .await?;
                }
                InstructionKind::Workdir => {
                    let dir = clean_join(rootfs, &state.workdir);
                    let _ = self.executor.run(&["mkdir", "-p", &dir]).await;
                }
                // ENV/USER only mutate state; EXPOSE/CMD/LABEL and
                // unknown instructions are metadata or no-ops here.
                _ => {}
            }

            let is_last = i + 1 == total;
            if !instr.kind.skips_checkpoint() || is_last {
                debug!(step = i + 1, "checkpointing layer");
                if let Err(e) = self.cache.save(&hashes[i], rootfs).await {
                    warn!(step = i + 1, "failed to save cache layer: {e}");
                }
            }
        }

        // Final image save.
        let out_tar = self.images.tarball_path(image_name);
        if shortcut {
            let last_layer = self.cache.layer_path(hashes.last().expect("non-empty hashes"));
            self.executor.run(&["cp", &last_layer, &out_tar]).await?;
        } else {
            let script = format!("tar -C '{}' -cf - . | gzip > '{}'", rootfs, out_tar);
            let cmd = self.executor.prepare(&["sh", "-c", &script]);
            run_with_progress(cmd, "Saving image").await?;
        }

        // Sidecar metadata from the fully-walked state.
        let meta = ImageMetadata {
            user: state.user.clone(),
            workdir: state.workdir.clone(),
            env: state.env.clone(),
            command: df.default_command().unwrap_or_default(),
        };
        self.images.save_metadata(image_name, &meta).await?;

        Ok(())
    }

    async fn extract_base(&self, base: &str, rootfs: &str) -> Result<()> {
        let base_tar = self.images.tarball_path(base);
        if !self.executor.succeeds(&["test", "-f", &base_tar]).await {
            info!(base, "base image not found, pulling");
            self.images.pull(base).await?;
        }
        let cmd = self
            .executor
            .prepare(&["tar", "-xzf", &base_tar, "-C", rootfs]);
        run_with_progress(cmd, "Extracting base image").await
    }

    // =========================================================================
    // RUN
    // =========================================================================

    async fn execute_run(
        &self,
        step: usize,
        instr: &Instruction,
        rootfs: &str,
        state: &BuildState,
    ) -> Result<()> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let script_name = format!("build_step_{}.sh", nanos);
        let script_path = format!("{}/tmp/{}", rootfs, script_name);

        self.executor
            .run(&["mkdir", "-p", &format!("{}/tmp", rootfs)])
            .await?;

        let script = format!("#!/bin/sh\nset -e\n{}\n{}\n", state.env_prefix, instr.raw);
        self.executor
            .run_with_input(&script, &["sh", "-c", &format!("cat > '{}'", script_path)])
            .await
            .map_err(|e| step_failed(step, instr, format!("write step script: {e}")))?;
        self.executor
            .run(&["chmod", "+x", &script_path])
            .await
            .map_err(|e| step_failed(step, instr, format!("chmod step script: {e}")))?;

        let exec_cmd = if !state.user.is_empty() && state.user != "root" {
            format!("su {} -c \"/tmp/{}\"", state.user, script_name)
        } else {
            format!("/tmp/{}", script_name)
        };

        let workdir_path = clean_join(rootfs, &state.workdir);
        // The sandbox: proc/sysfs mounted, device nodes recreated, DNS
        // copied in, then chroot. Unmounts happen on both success and
        // failure paths (RET captured before umount).
        let sandbox = format!(
            "mkdir -p {r}/proc {r}/sys {r}/dev {w} && \
             mount -t proc proc {r}/proc && \
             mount -t sysfs sys {r}/sys && \
             rm -f {r}/dev/null {r}/dev/zero {r}/dev/random {r}/dev/urandom && \
             mknod -m 666 {r}/dev/null c 1 3 && \
             mknod -m 666 {r}/dev/zero c 1 5 && \
             mknod -m 666 {r}/dev/random c 1 8 && \
             mknod -m 666 {r}/dev/urandom c 1 9 && \
             mkdir -p {r}/etc && \
             cat /etc/resolv.conf > {r}/etc/resolv.conf && \
             chroot {r} {cmd}; \
             RET=$?; umount {r}/proc {r}/sys 2>/dev/null; exit $RET",
            r = rootfs,
            w = workdir_path,
            cmd = exec_cmd,
        );

        self.executor
            .run(&["unshare", "--mount", "sh", "-c", &sandbox])
            .await
            .map_err(|e| step_failed(step, instr, e.to_string()))
    }

    // =========================================================================
    // COPY / ADD
    // =========================================================================

    async fn execute_copy(
        &self,
        step: usize,
        instr: &Instruction,
        ctx_dir: &Path,
        rootfs: &str,
        workdir: &str,
    ) -> Result<()> {
        let (src_arg, dest_arg) = match instr.args.as_slice() {
            [src, dest, ..] => (src.as_str(), dest.as_str()),
            _ => {
                return Err(step_failed(step, instr, "missing src/dest".to_string()));
            }
        };

        let src_host = ctx_dir.join(src_arg);
        let src_meta = std::fs::metadata(&src_host)
            .map_err(|e| step_failed(step, instr, format!("source {}: {}", src_host.display(), e)))?;
        let src_exec = self
            .mapper
            .absolutize_to_executor(&src_host)
            .map_err(|e| step_failed(step, instr, e.to_string()))?;

        let dest = clean_join(rootfs, &clean_join(workdir, dest_arg));

        if src_meta.is_file() {
            // Single file: plain copy into the destination path.
            let parent = match dest.rfind('/') {
                Some(idx) if idx > 0 => dest[..idx].to_string(),
                _ => "/".to_string(),
            };
            self.executor
                .shell(&format!("mkdir -p '{}' && cp '{}' '{}'", parent, src_exec, dest))
                .await
                .map_err(|e| step_failed(step, instr, e.to_string()))?;
            return Ok(());
        }

        // Directory: stream through tar so ignore patterns apply.
        let ignores = load_ignore_patterns(ctx_dir);
        let mut excludes = String::new();
        for pattern in &ignores {
            excludes.push_str(&format!("--exclude={:?} ", pattern));
        }

        debug!(src = src_arg, dest = dest_arg, "copying build context");
        let script = format!(
            "mkdir -p {dest} && tar -C {src} {excludes}-cf - . | tar -C {dest} -xf -",
            dest = dest,
            src = src_exec,
            excludes = excludes,
        );
        self.executor
            .shell(&script)
            .await
            .map_err(|e| step_failed(step, instr, e.to_string()))
    }
}

fn step_failed(step: usize, instr: &Instruction, cause: String) -> Error {
    Error::BuildStepFailed {
        step: step + 1,
        instruction: format!("{} {}", instr.kind, instr.raw),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_join() {
        assert_eq!(clean_join("/", "/x"), "/x");
        assert_eq!(clean_join("/app", "data"), "/app/data");
        assert_eq!(clean_join("/app/", "/data/"), "/app/data");
        assert_eq!(clean_join("/a", ""), "/a");
        assert_eq!(clean_join("", ""), "/");
    }

    #[test]
    fn test_build_state_accumulation() {
        let df = Dockerfile::parse(
            "FROM alpine\nENV A=1\nWORKDIR /srv\nUSER app\nENV B two\n",
        )
        .unwrap();
        let mut state = BuildState::new();
        for instr in &df.instructions {
            state.absorb(instr);
        }
        assert_eq!(state.env["A"], "1");
        assert_eq!(state.env["B"], "two");
        assert_eq!(state.workdir, "/srv");
        assert_eq!(state.user, "app");
        assert!(state.env_prefix.contains(r#"export A="1"; "#));
    }

    #[test]
    fn test_build_state_defaults() {
        let state = BuildState::new();
        assert_eq!(state.workdir, "/");
        assert_eq!(state.user, "root");
        assert!(state.env_prefix.is_empty());
    }
}
