//! # Container Runtime
//!
//! Drives a single container end-to-end: provision the rootfs, wire the
//! network, write authoritative metadata, and spawn the shim under
//! namespaces. All state lives in the container's directory inside the
//! executor:
//!
//! ```text
//! containers/<id>/
//!   rootfs/        freshly-extracted private root filesystem
//!   config.json    authoritative Container document
//!   console.log    detached stdout+stderr
//!   run.sh         launcher (present iff the container is detachable)
//!   shim.pid       PID of the shim, for fast stop
//! ```
//!
//! ## Ordering and Rollback
//!
//! Within one `run`, provisioning → networking → metadata → launch is
//! strictly sequential. A failure before the metadata write rolls back
//! everything already done (container directory, allocated IP, netns)
//! so no half-created container is ever observable. A failure *of the
//! user command itself* is not a provisioning failure: the container
//! exists, exited.
//!
//! ## Process Identification
//!
//! Shim processes are matched with the pattern `container-shim
//! <rootfs> ` — the trailing space is mandatory, otherwise container
//! `c1` would match `c11`. The PID file is the preferred path; the
//! pattern match is the fallback.

use crate::container::{Container, ContainerStatus, Mount, RunOptions};
use crate::error::{Error, Result};
use crate::executor::{Executor, run_with_progress};
use crate::images::ImageStore;
use crate::network::BridgeNetwork;
use crate::pathmap::PathMapper;
use crate::shim::{self, NONE_ARG, SHIM_SCRIPT};
use crate::volumes::VolumeStore;
use crate::constants::{HOST_ALIAS, validate_id};
use chrono::Utc;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Pure Helpers
// =============================================================================

/// Renders the `/etc/hosts-extra` payload for a container.
///
/// Contains the container's own name (loopback), the host alias at the
/// gateway, and any caller-specified `hostname:ip` pairs. Sibling
/// entries are appended by orchestrators on top of this file.
pub fn hosts_extra_content(name: &str, host_ip: &str, extra_hosts: &[String]) -> String {
    let mut out = String::new();
    if !name.is_empty() {
        out.push_str(&format!("127.0.0.1 {}\n", name));
    }
    if !host_ip.is_empty() {
        out.push_str(&format!("{} {}\n", host_ip, HOST_ALIAS));
    }
    for entry in extra_hosts {
        if let Some((hostname, ip)) = entry.split_once(':') {
            out.push_str(&format!("{} {}\n", ip, hostname));
        }
    }
    out
}

/// Script that lazily unmounts everything below `rootfs`, deepest
/// first.
///
/// `/proc/mounts` escapes spaces as `\040`, so field splitting is safe;
/// the variable stays quoted to survive those escaped names. `sort -r`
/// orders child mounts before their parents.
pub fn unmount_script(rootfs: &str) -> String {
    format!(
        r#"grep " {rootfs}" /proc/mounts | awk '{{print $2}}' | sort -r | while read -r mnt; do
  [ -n "$mnt" ] && umount -l "$mnt" 2>/dev/null || true
done"#,
        rootfs = rootfs
    )
}

/// True when a mount source must not be re-absolutized.
///
/// `update` runs from an unrelated CWD, so sources already made
/// absolute by the original `run` have to pass through untouched.
pub fn is_absolute_source(src: &str) -> bool {
    src.starts_with('/')
        || src.starts_with("\\\\")
        || (src.len() >= 3
            && src.as_bytes()[0].is_ascii_alphabetic()
            && src.as_bytes()[1] == b':'
            && (src.as_bytes()[2] == b'\\' || src.as_bytes()[2] == b'/'))
}

/// PATH exported inside the chroot before an exec'd command.
const EXEC_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Runtime
// =============================================================================

/// Container lifecycle service.
pub struct Runtime {
    executor: Arc<dyn Executor>,
    mapper: PathMapper,
    network: Arc<BridgeNetwork>,
    images: Arc<ImageStore>,
    volumes: Arc<VolumeStore>,
    containers_dir: String,
    /// Lazily detected executor default-route gateway (= the host).
    host_ip: Mutex<Option<String>>,
}

impl Runtime {
    pub fn new(
        executor: Arc<dyn Executor>,
        mapper: PathMapper,
        network: Arc<BridgeNetwork>,
        images: Arc<ImageStore>,
        volumes: Arc<VolumeStore>,
        containers_dir: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            mapper,
            network,
            images,
            volumes,
            containers_dir: containers_dir.into(),
            host_ip: Mutex::new(None),
        }
    }

    // =========================================================================
    // Paths
    // =========================================================================

    fn container_dir(&self, id: &str) -> String {
        format!("{}/{}", self.containers_dir, id)
    }

    fn rootfs_dir(&self, id: &str) -> String {
        format!("{}/rootfs", self.container_dir(id))
    }

    fn config_path(&self, id: &str) -> String {
        format!("{}/config.json", self.container_dir(id))
    }

    // =========================================================================
    // Listing and Resolution
    // =========================================================================

    /// Lists all containers by decoding every `config.json` in one
    /// executor call (a `find -exec cat {} +` stream of concatenated
    /// JSON documents).
    pub async fn list(&self) -> Result<Vec<Container>> {
        let script = format!(
            "find {} -name config.json -exec cat {{}} + 2>/dev/null || true",
            self.containers_dir
        );
        let out = self.executor.shell_output(&script).await.unwrap_or_default();

        let mut containers = Vec::new();
        for doc in serde_json::Deserializer::from_str(&out).into_iter::<Container>() {
            match doc {
                Ok(c) => containers.push(c),
                Err(e) => {
                    warn!("skipping undecodable config.json tail: {e}");
                    break;
                }
            }
        }
        Ok(containers)
    }

    /// Resolves a container id or name to its id.
    ///
    /// The directory test catches ids directly; names need a config
    /// scan.
    pub async fn resolve(&self, id_or_name: &str) -> Result<String> {
        if validate_id(id_or_name).is_ok()
            && self
                .executor
                .succeeds(&["test", "-d", &self.container_dir(id_or_name)])
                .await
        {
            return Ok(id_or_name.to_string());
        }

        for c in self.list().await? {
            if c.name == id_or_name {
                return Ok(c.id);
            }
        }
        Err(Error::container_not_found(id_or_name))
    }

    async fn load_config(&self, id: &str) -> Result<Container> {
        let text = self
            .executor
            .output(&["cat", &self.config_path(id)])
            .await
            .map_err(|_| Error::container_not_found(id))?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn save_config(&self, container: &Container) -> Result<()> {
        let json = serde_json::to_string(container)?;
        let script = format!("cat > {}", self.config_path(&container.id));
        self.executor
            .run_with_input(&json, &["sh", "-c", &script])
            .await
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Creates and starts a container. Returns the new container id.
    pub async fn run(&self, mut opts: RunOptions) -> Result<String> {
        // Id is always generated; a supplied name is an alias and must
        // be unique among existing containers.
        let id = format!(
            "c-{:x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        );
        if !opts.name.is_empty() {
            validate_id(&opts.name).map_err(|reason| {
                Error::InvalidArgument(format!("container name '{}': {}", opts.name, reason))
            })?;
            if self.resolve(&opts.name).await.is_ok() {
                return Err(Error::AlreadyExists {
                    kind: "container",
                    name: opts.name.clone(),
                });
            }
        }

        if opts.image.is_empty() {
            opts.image = "alpine".to_string();
        }
        if !self.images.exists(&opts.image).await {
            return Err(Error::image_not_found(format!(
                "{} (run 'plx pull {}' first)",
                opts.image, opts.image
            )));
        }

        // Image metadata fills whatever the caller left unset.
        let meta = self.images.load_metadata(&opts.image).await;
        meta.apply_defaults(&mut opts);
        if opts.args.is_empty() {
            return Err(Error::InvalidArgument(
                "no command given and image has no default CMD".to_string(),
            ));
        }

        info!(container = %id, image = %opts.image, args = ?opts.args, "running container");

        let mut allocated_ip: Option<String> = None;
        let mounts_str = match self.provision(&id, &mut opts, &mut allocated_ip).await {
            Ok(mounts_str) => mounts_str,
            Err(e) => {
                // Roll back in reverse: netns + IP, then the directory.
                if let Some(ip) = allocated_ip {
                    let _ = self.network.cleanup(&id, &ip).await;
                }
                let _ = self
                    .executor
                    .run(&["rm", "-rf", &self.container_dir(&id)])
                    .await;
                return Err(e);
            }
        };

        self.execute(&id, &opts, &mounts_str).await?;
        Ok(id)
    }

    /// Everything up to (and including) the metadata write. Returns the
    /// shim-ready mounts string. A failure here must leave no trace;
    /// [`Runtime::run`] rolls back.
    async fn provision(
        &self,
        id: &str,
        opts: &mut RunOptions,
        allocated_ip: &mut Option<String>,
    ) -> Result<String> {
        let rootfs = self.rootfs_dir(id);

        self.executor.run(&["mkdir", "-p", &rootfs]).await?;

        let tarball = self.images.tarball_path(&opts.image);
        let cmd = self.executor.prepare(&["tar", "-xzf", &tarball, "-C", &rootfs]);
        run_with_progress(cmd, "Provisioning container filesystem").await?;

        // Refresh the shim on every run so fleet upgrades propagate.
        if let Err(e) = self
            .executor
            .run_with_input(SHIM_SCRIPT, &["sh", "-c", &shim::install_command()])
            .await
        {
            warn!("failed to refresh shim: {e}");
        }

        let mounts_str = self.build_mounts_str(&mut opts.mounts, true).await?;

        // Networking: lazy bridge init, then the one-shot wiring script.
        self.network.setup_bridge().await?;
        let ip = self.network.allocate_ip()?;
        *allocated_ip = Some(ip.clone());
        self.network.apply(id, &ip).await?;

        // Service discovery file, appended to /etc/hosts by the shim.
        let host_ip = self.detect_host_ip().await;
        let hosts = hosts_extra_content(&opts.name, &host_ip, &opts.extra_hosts);
        let script = format!("mkdir -p {r}/etc && cat > {r}/etc/hosts-extra", r = rootfs);
        self.executor
            .run_with_input(&hosts, &["sh", "-c", &script])
            .await?;

        // Authoritative metadata; from here on the container exists.
        let container = Container {
            id: id.to_string(),
            name: opts.name.clone(),
            image: opts.image.clone(),
            command: opts.args.join(" "),
            created: Utc::now(),
            status: ContainerStatus::Running,
            ports: opts.ports.clone(),
            ip,
            config: opts.clone(),
        };
        self.save_config(&container).await?;

        // Detachable containers get their launcher script up front.
        if opts.detach {
            self.write_launcher(id, opts, &mounts_str).await?;
        }

        Ok(mounts_str)
    }

    /// Converts mount requests into the shim's `src:dst,...` string.
    ///
    /// Named volumes are resolved (and created) under the volumes
    /// root; bind sources are absolutized against the caller's CWD
    /// (`absolutize` = true only during `run` — `update` must not
    /// re-anchor stored paths).
    async fn build_mounts_str(
        &self,
        mounts: &mut [Mount],
        absolutize: bool,
    ) -> Result<String> {
        if mounts.is_empty() {
            return Ok(NONE_ARG.to_string());
        }

        let mut parts = Vec::new();
        for mount in mounts.iter_mut() {
            let src_exec = if mount.is_named_volume() {
                self.volumes.ensure(&mount.source).await?
            } else {
                if absolutize || !is_absolute_source(&mount.source) {
                    let abs = std::path::absolute(Path::new(&mount.source))
                        .map_err(|e| Error::PathMapping {
                            path: mount.source.clone().into(),
                            reason: e.to_string(),
                        })?;
                    // Auto-create the host directory on first use.
                    if !abs.exists() {
                        let _ = std::fs::create_dir_all(&abs);
                    }
                    mount.source = abs.to_string_lossy().into_owned();
                }
                self.mapper.to_executor(&mount.source)?
            };
            parts.push(format!("{}:{}", src_exec, mount.target));
        }

        Ok(if parts.is_empty() {
            NONE_ARG.to_string()
        } else {
            parts.join(",")
        })
    }

    async fn write_launcher(&self, id: &str, opts: &RunOptions, mounts_str: &str) -> Result<()> {
        let container_dir = self.container_dir(id);
        let unshare = shim::unshare_argv(
            &self.rootfs_dir(id),
            mounts_str,
            if opts.workdir.is_empty() { NONE_ARG } else { &opts.workdir },
            if opts.user.is_empty() { NONE_ARG } else { &opts.user },
            &format!("{}/shim.pid", container_dir),
            &opts.args,
        );
        let script = shim::launcher_script(&container_dir, &unshare);
        let install = format!(
            "cat > {d}/run.sh && chmod +x {d}/run.sh",
            d = container_dir
        );
        self.executor
            .run_with_input(&script, &["sh", "-c", &install])
            .await
    }

    /// Launches the provisioned container (detached or foreground).
    async fn execute(&self, id: &str, opts: &RunOptions, mounts_str: &str) -> Result<()> {
        let container_dir = self.container_dir(id);

        if opts.detach {
            self.spawn_detached(id).await?;
            info!(container = %id, "container started in background");
            return Ok(());
        }

        let argv = shim::launch_argv(
            id,
            &self.rootfs_dir(id),
            mounts_str,
            if opts.workdir.is_empty() { NONE_ARG } else { &opts.workdir },
            if opts.user.is_empty() { NONE_ARG } else { &opts.user },
            &format!("{}/shim.pid", container_dir),
            &opts.args,
        );
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();

        let mut cmd = self
            .executor
            .prepare_with_env(&argv_refs, &opts.env, opts.interactive);
        cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit());
        let status = cmd.status().await?;

        // The run is over either way; record Exited before reporting.
        if let Ok(mut c) = self.load_config(id).await {
            c.status = ContainerStatus::Exited;
            let _ = self.save_config(&c).await;
        }

        if !status.success() {
            return Err(Error::ExecutorFailed {
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Double-fork launch of `run.sh` inside the netns; survives the
    /// engine process and (on Windows) the WSL session.
    async fn spawn_detached(&self, id: &str) -> Result<()> {
        let dir = self.container_dir(id);
        let launch = format!(
            "nohup ip netns exec {id} sh {dir}/run.sh >{dir}/console.log 2>&1 </dev/null &",
            id = id,
            dir = dir
        );
        self.executor.shell(&launch).await
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Restarts a previously-detached, stopped container.
    ///
    /// The netns does not survive a reboot, so the network script is
    /// re-run; `host.plx.internal` is refreshed because the gateway may
    /// have moved. A failed launch rolls the status write back.
    pub async fn start(&self, id_or_name: &str) -> Result<()> {
        let id = self.resolve(id_or_name).await?;
        info!(container = %id, "starting container");

        if let Err(e) = self.network.setup_bridge().await {
            warn!("bridge setup failed, networking may be degraded: {e}");
        }

        let dir = self.container_dir(&id);
        let run_sh = format!("{}/run.sh", dir);
        if !self.executor.succeeds(&["test", "-f", &run_sh]).await {
            return Err(Error::InvalidArgument(format!(
                "container {} cannot be started (no launcher script)",
                id
            )));
        }

        let mut container = self.load_config(&id).await?;
        let previous_status = container.status;
        container.status = ContainerStatus::Running;
        self.save_config(&container).await?;

        if !container.ip.is_empty() {
            self.network.mark_ip_used(&container.ip);
            if let Err(e) = self.network.apply(&id, &container.ip).await {
                warn!("network re-wiring failed: {e}");
            }
        }

        // Refresh service discovery; the gateway can change between boots.
        let host_ip = self.detect_host_ip().await;
        let hosts = hosts_extra_content(
            &container.name,
            &host_ip,
            &container.config.extra_hosts,
        );
        let script = format!(
            "mkdir -p {r}/etc && cat > {r}/etc/hosts-extra",
            r = self.rootfs_dir(&id)
        );
        let _ = self
            .executor
            .run_with_input(&hosts, &["sh", "-c", &script])
            .await;

        if let Err(e) = self.spawn_detached(&id).await {
            container.status = previous_status;
            let _ = self.save_config(&container).await;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stops a container: kill the shim tree, then lazily unmount
    /// everything under the rootfs. Idempotent; cleanup failures are
    /// logged, not returned.
    pub async fn stop(&self, id_or_name: &str) -> Result<()> {
        let id = self.resolve(id_or_name).await?;
        let dir = self.container_dir(&id);
        let rootfs = self.rootfs_dir(&id);

        // Preferred path: the PID file, verified against /proc cmdline
        // before anything is killed.
        if let Ok(pid) = self.executor.output(&["cat", &format!("{}/shim.pid", dir)]).await {
            let pid = pid.trim().to_string();
            if !pid.is_empty()
                && pid.chars().all(|c| c.is_ascii_digit())
                && self.executor.succeeds(&["kill", "-0", &pid]).await
            {
                let cmdline = self
                    .executor
                    .output(&["cat", &format!("/proc/{}/cmdline", pid)])
                    .await
                    .unwrap_or_default();
                if cmdline.contains("container-shim") && cmdline.contains(&id) {
                    debug!(container = %id, pid = %pid, "killing shim by pid file");
                    let _ = self.executor.run(&["kill", "-9", &pid]).await;
                }
            }
        }

        // Fallback pattern kills; the `<id>/rootfs` suffix prevents
        // prefix collisions between ids.
        let _ = self
            .executor
            .shell(&format!("pkill -9 -f 'container-shim.*{}/rootfs' || true", id))
            .await;
        let _ = self
            .executor
            .shell(&format!("pkill -9 -f 'ip netns exec {}' || true", id))
            .await;

        if let Err(e) = self.executor.shell(&unmount_script(&rootfs)).await {
            warn!(container = %id, "unmount sweep failed: {e}");
        }

        if let Ok(mut c) = self.load_config(&id).await {
            c.status = ContainerStatus::Exited;
            let _ = self.save_config(&c).await;
        }

        info!(container = %id, "container stopped");
        Ok(())
    }

    // =========================================================================
    // Exec
    // =========================================================================

    /// Runs a command inside a running container's namespaces.
    ///
    /// Returns captured output for non-interactive calls; interactive
    /// calls inherit the TTY and return an empty string.
    pub async fn exec(
        &self,
        id_or_name: &str,
        cmd_args: &[String],
        interactive: bool,
    ) -> Result<String> {
        let id = self.resolve(id_or_name).await?;
        let rootfs = self.rootfs_dir(&id);

        // Trailing space after the rootfs path is what keeps `c1` from
        // matching `c11`.
        let pattern = format!("container-shim {} ", rootfs);
        let parent = match self.executor.output(&["pgrep", "-f", &pattern]).await {
            Ok(out) if !out.trim().is_empty() => {
                out.lines().next().unwrap_or_default().trim().to_string()
            }
            _ => {
                // Fallback scan over ps for older shims.
                let script = format!(
                    "ps -o pid,args | grep 'container-shim.*{}/rootfs' | grep -v grep | head -n 1 | awk '{{print $1}}'",
                    id
                );
                let out = self.executor.shell_output(&script).await.unwrap_or_default();
                let pid = out.trim().to_string();
                if pid.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "cannot find a running shim for container {} (is it running?)",
                        id
                    )));
                }
                pid
            }
        };

        // The shim's first child is the containerized process tree.
        let child = self
            .executor
            .output(&["pgrep", "-P", &parent])
            .await
            .ok()
            .and_then(|out| out.lines().next().map(|l| l.trim().to_string()))
            .filter(|pid| !pid.is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "cannot find container process under shim pid {}",
                    parent
                ))
            })?;

        let user_cmd = cmd_args.join(" ");
        let sh_cmd = format!("export PATH={}; {}", EXEC_PATH, user_cmd);
        let argv: [&str; 14] = [
            "nsenter",
            "-t",
            child.as_str(),
            "-m",
            "-n",
            "-u",
            "-i",
            "-p",
            "--",
            "chroot",
            rootfs.as_str(),
            "/bin/sh",
            "-c",
            sh_cmd.as_str(),
        ];

        debug!(container = %id, pid = %child, cmd = %user_cmd, "exec");
        if interactive {
            self.executor.run(&argv).await?;
            Ok(String::new())
        } else {
            self.executor.output(&argv).await
        }
    }

    // =========================================================================
    // Remove / Logs / IP
    // =========================================================================

    /// Deletes a container directory, then frees its IP and netns.
    /// Network cleanup failures are logged but never returned.
    pub async fn remove(&self, id_or_name: &str) -> Result<()> {
        let id = self.resolve(id_or_name).await?;
        let ip = self.get_ip(&id).await.unwrap_or_default();

        self.executor
            .run(&["rm", "-rf", &self.container_dir(&id)])
            .await?;

        if !ip.is_empty() && ip != "127.0.0.1" {
            if let Err(e) = self.network.cleanup(&id, &ip).await {
                warn!(container = %id, "network cleanup failed: {e}");
            }
        }
        info!(container = %id, "container removed");
        Ok(())
    }

    /// Returns the detached console log.
    pub async fn logs(&self, id_or_name: &str) -> Result<String> {
        let id = self.resolve(id_or_name).await?;
        self.executor
            .output(&["cat", &format!("{}/console.log", self.container_dir(&id))])
            .await
            .map_err(|_| {
                Error::InvalidArgument(format!("no logs for container {} yet", id))
            })
    }

    /// Reads the container's bridge IP from its config, defaulting to
    /// loopback for pre-network containers.
    pub async fn get_ip(&self, id_or_name: &str) -> Result<String> {
        let id = self.resolve(id_or_name).await?;
        let config = self.load_config(&id).await?;
        Ok(if config.ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            config.ip
        })
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Applies new run options to an existing container and regenerates
    /// its launcher script.
    ///
    /// Empty `mounts` preserves the stored mounts. Sources that are
    /// already absolute are never re-anchored — the CWD at update time
    /// is unrelated to the one at run time.
    pub async fn update(&self, id_or_name: &str, mut opts: RunOptions) -> Result<()> {
        let id = self.resolve(id_or_name).await?;
        let mut container = self.load_config(&id).await?;

        if opts.image.is_empty() {
            opts.image = container.image.clone();
        }
        if opts.name.is_empty() {
            opts.name = container.name.clone();
        }
        if opts.mounts.is_empty() {
            opts.mounts = container.config.mounts.clone();
        }

        container.command = opts.args.join(" ");
        container.ports = opts.ports.clone();
        container.name = opts.name.clone();
        container.config = opts.clone();
        self.save_config(&container).await?;

        let mounts_str = self.build_mounts_str(&mut opts.mounts, false).await?;
        self.write_launcher(&id, &opts, &mounts_str).await?;

        info!(container = %id, "configuration updated");
        Ok(())
    }

    // =========================================================================
    // Host IP
    // =========================================================================

    /// Detects (and caches) the executor's default-route gateway,
    /// which is the host machine as seen from inside WSL.
    async fn detect_host_ip(&self) -> String {
        if let Some(ip) = self.host_ip.lock().expect("host ip lock").clone() {
            return ip;
        }
        let detected = self
            .executor
            .shell_output(
                "ip route show | grep default | grep -oE '[0-9]+\\.[0-9]+\\.[0-9]+\\.[0-9]+' | head -n1",
            )
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let ip = if detected.is_empty() {
            "127.0.0.1".to_string()
        } else {
            detected
        };
        debug!(host_ip = %ip, "detected host gateway");
        self.host_ip.lock().expect("host ip lock").replace(ip.clone());
        ip
    }
}
