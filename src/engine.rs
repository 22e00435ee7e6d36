//! # Engine - Public Facade
//!
//! Composes the executor, image store, build engine, volume store,
//! network manager, runtime, and proxy manager into the operation set
//! surfaced to the CLI, HTTP dashboard, and compose orchestrator.
//!
//! ## Construction and State Recovery
//!
//! [`Engine::auto`] picks the executor for the current host (WSL2
//! distro on Windows, in-process on Linux). Construction always runs
//! [`Engine::recover`]: every existing `config.json` is scanned and its
//! IP pre-reserved, so allocations never collide with containers from
//! a previous engine process. Disk is authoritative across restarts;
//! the in-memory pool is authoritative while running.
//!
//! ## Global State
//!
//! The bridge, NAT rule, and `ip_forward` sysctl are process-external
//! state of the executor host. They are (re-)asserted as an idempotent
//! bootstrap step wherever needed, never assumed from a prior
//! invocation.

use crate::builder::BuildEngine;
use crate::cache::LayerCache;
use crate::constants::{
    BOOTSTRAP_IMAGE, BRIDGE_NAME, BUILDS_DIR, CACHE_DIR, CONTAINERS_DIR, DATA_ROOT,
    DISTRO_NAME, DISTRO_READY_INTERVAL, DISTRO_READY_RETRIES, IMAGES_DIR, SUBNET, VOLUMES_DIR,
    image_url,
};
use crate::container::{Container, RunOptions};
use crate::error::{Error, Result};
use crate::executor::Executor;
#[cfg(not(target_os = "windows"))]
use crate::executor::LocalExecutor;
use crate::executor::WslExecutor;
use crate::images::ImageStore;
use crate::network::BridgeNetwork;
use crate::pathmap::PathMapper;
use crate::proxy::ProxyManager;
use crate::runtime::Runtime;
use crate::shim::{self, SHIM_SCRIPT};
use crate::volumes::VolumeStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executor-side state root.
    pub data_root: String,
    /// Bridge device name.
    pub bridge: String,
    /// Container subnet (CIDR).
    pub subnet: String,
    /// Pinned WSL distribution name (Windows only).
    pub distro: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: DATA_ROOT.to_string(),
            bridge: BRIDGE_NAME.to_string(),
            subnet: SUBNET.to_string(),
            distro: DISTRO_NAME.to_string(),
        }
    }
}

impl EngineConfig {
    fn subdir(&self, name: &str) -> String {
        format!("{}/{}", self.data_root, name)
    }
}

/// Host-side data directory (`~/.pocketlinx`), used for the Windows
/// bootstrap tarball and distro VHD.
pub fn host_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".pocketlinx"))
        .unwrap_or_else(|| PathBuf::from(".pocketlinx"))
}

// =============================================================================
// Engine
// =============================================================================

/// The container engine facade.
pub struct Engine {
    executor: Arc<dyn Executor>,
    /// Present when driving WSL; needed for distro registration.
    wsl: Option<Arc<WslExecutor>>,
    config: EngineConfig,
    images: Arc<ImageStore>,
    cache: Arc<LayerCache>,
    volumes: Arc<VolumeStore>,
    network: Arc<BridgeNetwork>,
    runtime: Arc<Runtime>,
    builder: BuildEngine,
    proxy: Arc<ProxyManager>,
}

impl Engine {
    /// Builds an engine for the current host platform.
    pub async fn auto(config: EngineConfig) -> Result<Arc<Self>> {
        #[cfg(target_os = "windows")]
        {
            let wsl = Arc::new(WslExecutor::new(&config.distro));
            Self::assemble(wsl.clone(), Some(wsl), config).await
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self::assemble(Arc::new(LocalExecutor::new()), None, config).await
        }
    }

    /// Builds an engine over an explicit executor (tests, embedding).
    pub async fn with_executor(
        executor: Arc<dyn Executor>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        Self::assemble(executor, None, config).await
    }

    async fn assemble(
        executor: Arc<dyn Executor>,
        wsl: Option<Arc<WslExecutor>>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let mapper = PathMapper::new(executor.path_style());

        let images = Arc::new(ImageStore::new(
            executor.clone(),
            mapper,
            config.subdir(IMAGES_DIR),
        ));
        let cache = Arc::new(LayerCache::new(executor.clone(), config.subdir(CACHE_DIR)));
        let volumes = Arc::new(VolumeStore::new(
            executor.clone(),
            config.subdir(VOLUMES_DIR),
        ));
        let network = Arc::new(BridgeNetwork::new(
            executor.clone(),
            config.bridge.clone(),
            config.subnet.clone(),
        )?);
        let runtime = Arc::new(Runtime::new(
            executor.clone(),
            mapper,
            network.clone(),
            images.clone(),
            volumes.clone(),
            config.subdir(CONTAINERS_DIR),
        ));
        let builder = BuildEngine::new(
            executor.clone(),
            mapper,
            images.clone(),
            cache.clone(),
            config.subdir(BUILDS_DIR),
        );
        let proxy = Arc::new(ProxyManager::new(executor.clone()));

        let engine = Arc::new(Self {
            executor,
            wsl,
            config,
            images,
            cache,
            volumes,
            network,
            runtime,
            builder,
            proxy,
        });
        engine.recover().await;
        Ok(engine)
    }

    /// Re-reserves the IPs of every container found on disk.
    async fn recover(&self) {
        match self.runtime.list().await {
            Ok(containers) => {
                for c in &containers {
                    self.network.mark_ip_used(&c.ip);
                }
                info!(
                    containers = containers.len(),
                    reserved_ips = self.network.used_count(),
                    "recovered network state"
                );
            }
            Err(e) => {
                warn!("state recovery failed, IP collisions possible: {e}");
            }
        }
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// Provisions the engine environment: data directories, the shim,
    /// and (on WSL) the distro-side tooling.
    pub async fn setup(&self) -> Result<()> {
        info!("setting up engine environment");

        for sub in [IMAGES_DIR, CACHE_DIR, VOLUMES_DIR, BUILDS_DIR, CONTAINERS_DIR] {
            self.executor
                .run(&["mkdir", "-p", &self.config.subdir(sub)])
                .await?;
        }

        self.executor
            .run_with_input(SHIM_SCRIPT, &["sh", "-c", &shim::install_command()])
            .await?;

        if self.wsl.is_some() {
            self.setup_distro().await?;
        }

        info!("environment is ready");
        Ok(())
    }

    /// Distro-side initialization: pin resolv.conf handling, install
    /// the tooling the engine shells out to, neutralize the Alpine
    /// ldconfig that trips the WSL init process, and flush NAT rules
    /// left by older versions.
    async fn setup_distro(&self) -> Result<()> {
        let script = r#"
cat <<EOF > /etc/wsl.conf
[network]
generateResolvConf = false
[interop]
enabled = true
appendWindowsPath = true
EOF

echo "nameserver 8.8.8.8" > /etc/resolv.conf
echo "nameserver 1.1.1.1" >> /etc/resolv.conf

apk update
apk add --no-cache util-linux socat iproute2 iptables ethtool

mkdir -p /etc/ld.so.conf.d
rm -f /sbin/ldconfig /usr/sbin/ldconfig
printf '#!/bin/sh\nexit 0\n' > /sbin/ldconfig
chmod +x /sbin/ldconfig
cp /sbin/ldconfig /usr/sbin/ldconfig

command -v iptables >/dev/null || apk add --no-cache iptables
iptables -t nat -F

sync
"#;
        self.executor
            .run_with_input(script, &["sh", "-e"])
            .await
            .map_err(|e| Error::Internal(format!("distro initialization failed: {e}")))
    }

    /// Copies the running binary into the host data dir's `bin/`.
    /// PATH manipulation is left to the user or package manager.
    pub async fn install(&self) -> Result<()> {
        let bin_dir = host_data_dir().join("bin");
        std::fs::create_dir_all(&bin_dir)?;
        let exe = std::env::current_exe()?;
        let name = exe
            .file_name()
            .ok_or_else(|| Error::Internal("unnamed executable".to_string()))?;
        let target = bin_dir.join(name);
        std::fs::copy(&exe, &target)?;
        info!(target = %target.display(), "installed binary");
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Ensures an image is present. On Windows the bootstrap image
    /// additionally registers the system distro on first pull.
    pub async fn pull(&self, image: &str) -> Result<()> {
        if image == BOOTSTRAP_IMAGE
            && let Some(wsl) = &self.wsl
        {
            return self.pull_bootstrap(wsl.clone()).await;
        }
        self.images.pull(image).await
    }

    /// Bootstrap path: fetch the tarball host-side, import the distro
    /// from it once, install the shim, and cache the tarball into the
    /// executor's image store for `run`/`build` to use.
    async fn pull_bootstrap(&self, wsl: Arc<WslExecutor>) -> Result<()> {
        let url = image_url(BOOTSTRAP_IMAGE)
            .ok_or_else(|| Error::Unsupported(BOOTSTRAP_IMAGE.to_string()))?;

        let host_images = host_data_dir().join("images");
        std::fs::create_dir_all(&host_images)?;
        let tarball = host_images.join(format!("{}.tar.gz", BOOTSTRAP_IMAGE));

        if !tarball.exists() {
            info!(image = BOOTSTRAP_IMAGE, "downloading bootstrap image");
            let ps = format!(
                "Invoke-WebRequest -Uri {} -OutFile {}",
                url,
                tarball.display()
            );
            let status = tokio::process::Command::new("powershell.exe")
                .args(["-Command", &ps])
                .status()
                .await?;
            if !status.success() {
                let _ = std::fs::remove_file(&tarball);
                return Err(Error::Internal(
                    "bootstrap image download failed".to_string(),
                ));
            }
        }

        if wsl.distro_exists().await {
            info!(distro = wsl.distro(), "system distro already exists, keeping data");
        } else {
            info!(distro = wsl.distro(), "importing system distro");
            let distro_dir = host_data_dir().join("distro");
            let _ = wsl.wsl(&["--unregister", wsl.distro()]).await;
            let _ = std::fs::remove_dir_all(&distro_dir);
            std::fs::create_dir_all(&distro_dir)?;

            let distro_dir_s = distro_dir.to_string_lossy().into_owned();
            let tarball_s = tarball.to_string_lossy().into_owned();
            wsl.wsl(&[
                "--import",
                wsl.distro(),
                &distro_dir_s,
                &tarball_s,
                "--version",
                "2",
            ])
            .await
            .map_err(|e| Error::Internal(format!("distro import failed: {e}")))?;
            wsl.wait_until_ready(DISTRO_READY_RETRIES, DISTRO_READY_INTERVAL)
                .await?;
        }

        info!("installing container shim");
        self.executor
            .run_with_input(SHIM_SCRIPT, &["sh", "-c", &shim::install_command()])
            .await?;

        // Cache into the executor so run/build never reach back out.
        let images_dir = self.config.subdir(IMAGES_DIR);
        self.executor.run(&["mkdir", "-p", &images_dir]).await?;
        let mapper = PathMapper::new(self.executor.path_style());
        let src = mapper.absolutize_to_executor(&tarball)?;
        let dst = format!("{}/{}.tar.gz", images_dir, BOOTSTRAP_IMAGE);
        self.executor.run(&["cp", &src, &dst]).await?;

        Ok(())
    }

    /// Lists image names.
    pub async fn images(&self) -> Result<Vec<String>> {
        self.images.list().await
    }

    /// Human-readable added/removed file diff between two images.
    pub async fn diff(&self, a: &str, b: &str) -> Result<String> {
        self.images.diff(a, b).await
    }

    /// Packages `files(target) \ files(base)` into a host-side
    /// gzipped tar.
    pub async fn package(&self, base: &str, target: &str, out_path: &str) -> Result<()> {
        self.images.export_diff(base, target, out_path).await
    }

    /// Builds an image from a Dockerfile. Returns the image name.
    pub async fn build(
        &self,
        ctx_dir: &std::path::Path,
        dockerfile: &str,
        tag: &str,
    ) -> Result<String> {
        self.builder.build(ctx_dir, dockerfile, tag).await
    }

    /// Removes all build cache layers (images are untouched).
    pub async fn prune(&self) -> Result<()> {
        self.cache.prune().await
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Creates and starts a container; returns its id.
    pub async fn run(&self, opts: RunOptions) -> Result<String> {
        self.runtime.run(opts).await
    }

    /// Restarts a stopped, detachable container.
    pub async fn start(&self, id_or_name: &str) -> Result<()> {
        self.runtime.start(id_or_name).await
    }

    /// Stops a container's process tree and unmounts its rootfs.
    pub async fn stop(&self, id_or_name: &str) -> Result<()> {
        self.runtime.stop(id_or_name).await
    }

    /// Lists all containers.
    pub async fn ps(&self) -> Result<Vec<Container>> {
        self.runtime.list().await
    }

    /// Returns a container's console log.
    pub async fn logs(&self, id_or_name: &str) -> Result<String> {
        self.runtime.logs(id_or_name).await
    }

    /// Removes a container and frees its network resources.
    pub async fn rm(&self, id_or_name: &str) -> Result<()> {
        self.runtime.remove(id_or_name).await
    }

    /// Executes a command inside a running container.
    pub async fn exec(
        &self,
        id_or_name: &str,
        cmd: &[String],
        interactive: bool,
    ) -> Result<String> {
        self.runtime.exec(id_or_name, cmd, interactive).await
    }

    /// Updates a container's stored run options and launcher.
    pub async fn update(&self, id_or_name: &str, opts: RunOptions) -> Result<()> {
        self.runtime.update(id_or_name, opts).await
    }

    /// Returns a container's bridge IP.
    pub async fn get_ip(&self, id_or_name: &str) -> Result<String> {
        self.runtime.get_ip(id_or_name).await
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Creates a named volume.
    pub async fn volume_create(&self, name: &str) -> Result<()> {
        self.volumes.create(name).await
    }

    /// Removes a named volume.
    pub async fn volume_rm(&self, name: &str) -> Result<()> {
        self.volumes.remove(name).await
    }

    /// Lists named volumes.
    pub async fn volume_ls(&self) -> Result<Vec<String>> {
        self.volumes.list().await
    }

    // =========================================================================
    // Proxy
    // =========================================================================

    /// Starts the port-proxy reconcile loop. The returned handle owns
    /// the loop; aborting it stops reconciliation (listeners are torn
    /// down via [`Engine::stop_proxies`]).
    pub fn start_proxies(self: &Arc<Self>) -> JoinHandle<()> {
        self.proxy.clone().spawn(self.runtime.clone())
    }

    /// Tears down every proxy listener and its pending connections.
    pub async fn stop_proxies(&self) {
        self.proxy.shutdown().await;
    }

    /// The proxy manager (dashboard introspection).
    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxy
    }
}
