//! Constants for the container engine.
//!
//! All paths, network defaults, timeouts, and the supported-image
//! allow-list live here to keep magic values out of the modules.

use std::time::Duration;

// =============================================================================
// Executor-Side Layout
// =============================================================================

/// Root of all engine state inside the executor.
pub const DATA_ROOT: &str = "/var/lib/pocketlinx";

/// Subdirectory for image tarballs and metadata sidecars.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory for build cache layers.
pub const CACHE_DIR: &str = "cache";

/// Subdirectory for named volumes.
pub const VOLUMES_DIR: &str = "volumes";

/// Subdirectory for transient build roots.
pub const BUILDS_DIR: &str = "builds";

/// Subdirectory for container state.
pub const CONTAINERS_DIR: &str = "containers";

/// Where the shim is installed inside the executor.
pub const SHIM_PATH: &str = "/usr/local/bin/container-shim";

// =============================================================================
// Network Defaults
// =============================================================================

/// Default bridge device name.
pub const BRIDGE_NAME: &str = "plx0";

/// Default container subnet (CIDR).
pub const SUBNET: &str = "10.10.0.0/24";

/// First assignable host octet in the pool (gateway is `.1`).
pub const IP_POOL_FIRST: u8 = 2;

/// Last assignable host octet in the pool.
pub const IP_POOL_LAST: u8 = 254;

/// DNS alias injected into every container, resolving to the host gateway.
pub const HOST_ALIAS: &str = "host.plx.internal";

/// Attempts when polling for the veth peer to appear inside a netns.
/// 20 attempts at 100 ms is the 2 s hard cap.
pub const NETNS_DEV_POLL_ATTEMPTS: u32 = 20;

/// Interval between netns device polls.
pub const NETNS_DEV_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// WSL Defaults
// =============================================================================

/// Name of the pinned system distribution on Windows.
pub const DISTRO_NAME: &str = "pocketlinx";

/// Retries while waiting for a freshly imported distro to answer.
pub const DISTRO_READY_RETRIES: u32 = 10;

/// Interval between distro readiness probes.
pub const DISTRO_READY_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Proxy
// =============================================================================

/// Interval between proxy reconciliation passes.
pub const PROXY_SYNC_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Build
// =============================================================================

/// Build-context ignore file consulted by COPY and context hashing.
pub const BUILD_IGNORE_FILE: &str = ".plxignore";

/// Cap on listed entries per section in `diff` output.
pub const DIFF_LIST_CAP: usize = 20;

// =============================================================================
// Supported Images
// =============================================================================

/// The image used to bootstrap the system distro on Windows.
pub const BOOTSTRAP_IMAGE: &str = "alpine";

/// Allow-list of pullable images and their rootfs tarball URLs.
///
/// Anything outside this list is rejected with [`Error::Unsupported`];
/// arbitrary registry protocols are deliberately not spoken.
///
/// [`Error::Unsupported`]: crate::error::Error::Unsupported
pub const SUPPORTED_IMAGES: &[(&str, &str)] = &[
    (
        "alpine",
        "https://dl-cdn.alpinelinux.org/alpine/v3.21/releases/x86_64/alpine-minirootfs-3.21.0-x86_64.tar.gz",
    ),
    (
        "ubuntu",
        "https://cdimage.ubuntu.com/ubuntu-base/releases/24.04/release/ubuntu-base-24.04-base-amd64.tar.gz",
    ),
];

/// Looks up the download URL for a supported image name.
pub fn image_url(name: &str) -> Option<&'static str> {
    SUPPORTED_IMAGES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, url)| *url)
}

// =============================================================================
// Validation
// =============================================================================

/// Characters allowed in container ids and names.
///
/// Ids end up in netns names, veth suffixes, and shell patterns, so the
/// character set is kept shell-inert.
pub const ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Validates a container id or name.
///
/// Returns a human-readable reason on rejection.
pub fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("must not be empty");
    }
    if id.len() > 64 {
        return Err("must be at most 64 characters");
    }
    if !id.chars().all(|c| ID_VALID_CHARS.contains(c)) {
        return Err("may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}
