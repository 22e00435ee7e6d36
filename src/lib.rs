//! # pocketlinx
//!
//! **Portable Single-Binary Container Runtime**
//!
//! Runs Linux containers on a Windows host through a pinned WSL2
//! distribution, or directly on Linux. One process drives everything:
//! image storage, layered builds with content-addressed caching,
//! per-container filesystem provisioning, namespace isolation via a
//! shell shim, bridge networking with NAT, and host-side port
//! proxying.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Engine                                │
//! │  setup · pull · build · run · exec · stop · rm · update · ...   │
//! ├───────────┬───────────┬───────────┬───────────┬─────────────────┤
//! │ ImageStore│ BuildEngine│ Runtime  │ VolumeStore│ ProxyManager   │
//! │ tarballs  │ hash-chain │ lifecycle│ named dirs │ 127.0.0.N:port │
//! │ + sidecar │ layer cache│ + shim   │            │ → socat relay  │
//! ├───────────┴───────────┬┴──────────┴───────────┬─────────────────┤
//! │     BridgeNetwork     │       PathMapper      │                 │
//! │  plx0 · veth · netns  │  C:\x → /mnt/c/x      │                 │
//! ├───────────────────────┴───────────────────────┴─────────────────┤
//! │                         Executor                                │
//! │        WslExecutor (wsl.exe -d … -u root --)                    │
//! │        LocalExecutor (host kernel, in-process)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution Model
//!
//! All container-visible mutations are shell/syscall commands issued
//! through the [`Executor`](executor::Executor). A container is a
//! freshly-extracted private rootfs plus the shim: a shell bootstrap
//! that mounts proc/sys/dev, wires DNS and `/etc/hosts`, binds
//! volumes, chroots, and drops to the requested user — all under
//! `ip netns exec <id> unshare --mount --pid --fork --uts`.
//!
//! There is no overlay filesystem, no OCI manifest, and no cgroup
//! accounting: images are plain gzipped rootfs tarballs with a JSON
//! sidecar, and each container extracts its own copy.
//!
//! # Networking
//!
//! Containers live on the `plx0` bridge (`10.10.0.0/24`, gateway
//! `.1`) with a MASQUERADE rule for the outside world. Published ports
//! are reachable on the host at `127.0.0.N:<port>` where `N` is the
//! last octet of the container IP, so two containers can publish the
//! same port without colliding. Inside each container,
//! `host.plx.internal` resolves to the host machine.
//!
//! # Example
//!
//! ```rust,ignore
//! use pocketlinx::{Engine, EngineConfig, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> pocketlinx::Result<()> {
//!     let engine = Engine::auto(EngineConfig::default()).await?;
//!
//!     engine.pull("alpine").await?;
//!     let id = engine
//!         .run(RunOptions {
//!             image: "alpine".into(),
//!             name: "hello".into(),
//!             args: vec!["echo".into(), "hi".into()],
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     println!("container {} exited", id);
//!     engine.rm(&id).await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod builder;
pub mod cache;
pub mod constants;
pub mod container;
pub mod dockerfile;
pub mod engine;
pub mod error;
pub mod executor;
pub mod images;
pub mod network;
pub mod pathmap;
pub mod proxy;
pub mod runtime;
pub mod shim;
pub mod volumes;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use container::{Container, ContainerStatus, ImageMetadata, Mount, PortMapping, RunOptions};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use executor::{Executor, LocalExecutor, WslExecutor};
pub use pathmap::{PathMapper, PathStyle};
