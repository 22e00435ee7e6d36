//! # Bridge Network Manager
//!
//! Gives every container an IP on a private bridge subnet with NAT to
//! the outside world.
//!
//! ## Topology
//!
//! ```text
//!   host netns                      container netns (named by id)
//!  ┌───────────────────────┐      ┌──────────────────────┐
//!  │  plx0 (10.10.0.1/24)  │      │  eth0 (10.10.0.N/24) │
//!  │    └── vethXXXXXXXX ──┼──────┼── (peer, renamed)    │
//!  │  MASQUERADE 10.10.0.0/24     │  default via 10.10.0.1
//!  └───────────────────────┘      └──────────────────────┘
//! ```
//!
//! ## One Script, One Call
//!
//! Per-container wiring is emitted as a single shell script executed in
//! one executor call. Issuing the dozen `ip` commands individually is
//! prohibitively slow across the Windows→WSL process boundary.
//!
//! ## IP Allocation
//!
//! First-free allocation out of `.2 .. .254`, serialized by a mutex —
//! the only shared mutable state between concurrent `run`s. The pool is
//! reseeded at engine start from the `ip` fields of existing
//! `config.json` documents, so allocations survive engine restarts.

use crate::constants::{
    IP_POOL_FIRST, IP_POOL_LAST, NETNS_DEV_POLL_ATTEMPTS, NETNS_DEV_POLL_INTERVAL,
};
use crate::error::{Error, Result};
use crate::executor::Executor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Derives `(host, peer)` veth device names from a container id.
///
/// Device names are capped at 15 chars by the kernel, so only the last
/// 8 chars of the id are used (ids are timestamp-based, so the high
/// bits carry no variance).
pub fn veth_names(container_id: &str) -> (String, String) {
    let short = if container_id.len() > 8 {
        &container_id[container_id.len() - 8..]
    } else {
        container_id
    };
    (format!("veth{}", short), format!("ceth{}", short))
}

/// Bridge, NAT, and per-container netns/veth management.
pub struct BridgeNetwork {
    executor: Arc<dyn Executor>,
    bridge: String,
    subnet: String,
    gateway: String,
    prefix: String,
    used: Mutex<HashSet<String>>,
}

impl BridgeNetwork {
    /// Creates a manager for `bridge` over `subnet` (e.g. `10.10.0.0/24`).
    pub fn new(
        executor: Arc<dyn Executor>,
        bridge: impl Into<String>,
        subnet: impl Into<String>,
    ) -> Result<Self> {
        let subnet = subnet.into();
        let network = subnet
            .split('/')
            .next()
            .unwrap_or_default();
        let prefix = match network.rfind('.') {
            Some(idx) => network[..=idx].to_string(),
            None => {
                return Err(Error::NetworkSetupFailed(format!(
                    "malformed subnet '{}'",
                    subnet
                )));
            }
        };
        let gateway = format!("{}1", prefix);

        Ok(Self {
            executor,
            bridge: bridge.into(),
            subnet,
            gateway,
            prefix,
            used: Mutex::new(HashSet::new()),
        })
    }

    /// The gateway address (`.1` of the subnet).
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// The bridge device name.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    // =========================================================================
    // Bridge Bootstrap
    // =========================================================================

    /// Creates the bridge, gateway address, NAT rule, and IP forwarding.
    ///
    /// Idempotent: if the bridge device already exists only the sysctl
    /// is re-asserted, and the MASQUERADE rule is guarded by
    /// `iptables -C` so repeated setup leaves exactly one rule.
    pub async fn setup_bridge(&self) -> Result<()> {
        if self
            .executor
            .succeeds(&["/sbin/ip", "link", "show", &self.bridge])
            .await
        {
            debug!(bridge = %self.bridge, "bridge already exists");
            let _ = self
                .executor
                .shell("echo 1 > /proc/sys/net/ipv4/ip_forward")
                .await;
            return Ok(());
        }

        info!(bridge = %self.bridge, subnet = %self.subnet, "initializing network bridge");

        self.executor
            .run(&["/sbin/ip", "link", "add", "name", &self.bridge, "type", "bridge"])
            .await
            .map_err(|e| Error::NetworkSetupFailed(format!("create bridge: {e}")))?;

        let cidr = format!("{}/24", self.gateway);
        self.executor
            .run(&["/sbin/ip", "addr", "add", &cidr, "dev", &self.bridge])
            .await
            .map_err(|e| Error::NetworkSetupFailed(format!("assign gateway: {e}")))?;

        self.executor
            .run(&["/sbin/ip", "link", "set", &self.bridge, "up"])
            .await
            .map_err(|e| Error::NetworkSetupFailed(format!("bridge up: {e}")))?;

        let _ = self
            .executor
            .shell("echo 1 > /proc/sys/net/ipv4/ip_forward")
            .await;
        let _ = self
            .executor
            .run(&["sysctl", "-w", "net.ipv4.ip_forward=1"])
            .await;

        // Guard with -C so re-running setup never stacks duplicate rules.
        let rule = format!(
            "POSTROUTING -s {s} ! -d {s} -j MASQUERADE",
            s = self.subnet
        );
        let check = format!("/sbin/iptables -t nat -C {}", rule);
        if self.executor.shell_output(&check).await.is_err() {
            self.executor
                .shell(&format!("/sbin/iptables -t nat -A {}", rule))
                .await
                .map_err(|e| Error::NetworkSetupFailed(format!("NAT rule: {e}")))?;
        }

        Ok(())
    }

    // =========================================================================
    // IP Pool
    // =========================================================================

    /// Allocates the first free IP in the pool.
    pub fn allocate_ip(&self) -> Result<String> {
        let mut used = self.used.lock().expect("ip pool lock poisoned");
        for octet in IP_POOL_FIRST..=IP_POOL_LAST {
            let ip = format!("{}{}", self.prefix, octet);
            if !used.contains(&ip) {
                used.insert(ip.clone());
                return Ok(ip);
            }
        }
        Err(Error::IpExhausted)
    }

    /// Returns an IP to the pool.
    pub fn release_ip(&self, ip: &str) {
        let mut used = self.used.lock().expect("ip pool lock poisoned");
        used.remove(ip);
    }

    /// Marks an IP as taken (state recovery from existing containers).
    pub fn mark_ip_used(&self, ip: &str) {
        if ip.is_empty() {
            return;
        }
        let mut used = self.used.lock().expect("ip pool lock poisoned");
        used.insert(ip.to_string());
    }

    /// Number of currently reserved addresses.
    pub fn used_count(&self) -> usize {
        self.used.lock().expect("ip pool lock poisoned").len()
    }

    // =========================================================================
    // Per-Container Wiring
    // =========================================================================

    /// Renders the one-shot wiring script for a container.
    ///
    /// Returns `(script, host_veth)`. The script:
    /// 1. removes any stale netns/veth left by a previous incarnation,
    /// 2. creates the netns and veth pair, attaches the host side to
    ///    the bridge,
    /// 3. moves the peer into the netns — a failure here is fatal
    ///    because it would leave a ghost device,
    /// 4. inside the netns: waits for the device (≤ 2 s), renames it to
    ///    `eth0`, assigns the address, default-routes via the gateway,
    ///    and disables tx checksum offload (best-effort).
    pub fn setup_script(&self, container_id: &str, ip: &str) -> (String, String) {
        let (host_veth, peer_veth) = veth_names(container_id);

        let script = format!(
            r#"set -e
mkdir -p /var/run/netns
# Stale namespace/device cleanup prevents "File exists" on re-run
ip netns del {id} 2>/dev/null || true
ip netns add {id}

ip link del {host} 2>/dev/null || true
if ! ip link show {host} >/dev/null 2>&1; then
  ip link add {host} type veth peer name {peer}
  ip link set {host} master {bridge}
  ip link set {host} up
fi

# Move the peer in; fail fast so no ghost device survives
ip link set {peer} netns {id}

ip netns exec {id} sh -c '
  set -e
  ip link set lo up 2>/dev/null || true
  _i=0
  _found=0
  while [ "$_i" -lt {attempts} ]; do
    if ip link show {peer} >/dev/null 2>&1; then _found=1; break; fi
    sleep 0.1
    _i=$((_i+1))
  done
  if [ "$_found" -eq 0 ]; then
    echo "Error: device {peer} failed to appear in netns" >&2
    exit 124
  fi
  ip link set {peer} name eth0

  if ! ip addr show eth0 | grep -q "{ip}"; then
    ip addr add {ip}/24 dev eth0
  fi
  ip link set eth0 up
  ip route add default via {gw} 2>/dev/null || true
  ethtool -K eth0 tx off 2>/dev/null || true
'
"#,
            id = container_id,
            host = host_veth,
            peer = peer_veth,
            bridge = self.bridge,
            attempts = NETNS_DEV_POLL_ATTEMPTS,
            ip = ip,
            gw = self.gateway,
        );

        (script, host_veth)
    }

    /// Executes the wiring script in one executor call.
    ///
    /// On failure the host-side veth and netns are reaped so the 2 s
    /// device timeout does not leave a dangling bridge port behind.
    /// Exit code 124 from the script is the poll giving up, surfaced
    /// as [`Error::Timeout`].
    pub async fn apply(&self, container_id: &str, ip: &str) -> Result<()> {
        let (script, host_veth) = self.setup_script(container_id, ip);
        match self.executor.run_with_input(&script, &["sh", "-e"]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(container = container_id, "network wiring failed, reaping {host_veth}");
                let _ = self
                    .executor
                    .shell(&format!("ip link del {} 2>/dev/null || true", host_veth))
                    .await;
                let _ = self
                    .executor
                    .shell(&format!("ip netns del {} 2>/dev/null || true", container_id))
                    .await;

                if let Error::ExecutorFailed { status: 124, .. } = e {
                    return Err(Error::Timeout {
                        operation: format!(
                            "waiting for veth peer in netns {}",
                            container_id
                        ),
                        duration: NETNS_DEV_POLL_INTERVAL * NETNS_DEV_POLL_ATTEMPTS,
                    });
                }
                Err(Error::NetworkSetupFailed(format!(
                    "container {}: {}",
                    container_id, e
                )))
            }
        }
    }

    /// Frees the IP and deletes the netns; the veth pair is reaped
    /// transitively with the namespace.
    pub async fn cleanup(&self, container_id: &str, ip: &str) -> Result<()> {
        self.release_ip(ip);
        self.executor
            .run(&["/sbin/ip", "netns", "del", container_id])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalExecutor;

    fn network() -> BridgeNetwork {
        BridgeNetwork::new(Arc::new(LocalExecutor::new()), "plx0", "10.10.0.0/24").unwrap()
    }

    #[test]
    fn test_gateway_derivation() {
        let net = network();
        assert_eq!(net.gateway(), "10.10.0.1");
    }

    #[test]
    fn test_malformed_subnet_rejected() {
        let result = BridgeNetwork::new(Arc::new(LocalExecutor::new()), "plx0", "garbage");
        assert!(result.is_err());
    }

    #[test]
    fn test_allocation_is_first_free() {
        let net = network();
        assert_eq!(net.allocate_ip().unwrap(), "10.10.0.2");
        assert_eq!(net.allocate_ip().unwrap(), "10.10.0.3");
        net.release_ip("10.10.0.2");
        assert_eq!(net.allocate_ip().unwrap(), "10.10.0.2");
    }

    #[test]
    fn test_mark_used_skips_recovered_ips() {
        let net = network();
        net.mark_ip_used("10.10.0.2");
        net.mark_ip_used("10.10.0.3");
        assert_eq!(net.allocate_ip().unwrap(), "10.10.0.4");
    }

    #[test]
    fn test_pool_exhaustion() {
        let net = network();
        for _ in IP_POOL_FIRST..=IP_POOL_LAST {
            net.allocate_ip().unwrap();
        }
        assert!(matches!(net.allocate_ip(), Err(Error::IpExhausted)));
    }

    #[test]
    fn test_veth_names_use_id_suffix() {
        let (host, peer) = veth_names("c-18f2a9b3c4d5e6f7");
        assert_eq!(host, "vethc4d5e6f7");
        assert_eq!(peer, "cethc4d5e6f7");
        assert!(host.len() <= 15, "kernel caps device names at 15 chars");

        let (host, peer) = veth_names("web");
        assert_eq!(host, "vethweb");
        assert_eq!(peer, "cethweb");
    }

    #[test]
    fn test_setup_script_contents() {
        let net = network();
        let (script, host_veth) = net.setup_script("c-12345678", "10.10.0.7");

        assert!(script.contains("ip netns add c-12345678"));
        assert!(script.contains(&format!("ip link set {} master plx0", host_veth)));
        assert!(script.contains("ip link set ceth"));
        assert!(script.contains("name eth0"));
        assert!(script.contains("ip addr add 10.10.0.7/24"));
        assert!(script.contains("default via 10.10.0.1"));
        assert!(script.contains("ethtool -K eth0 tx off"));
        // Stale-state cleanup must precede creation
        let del = script.find("ip netns del").unwrap();
        let add = script.find("ip netns add").unwrap();
        assert!(del < add);
    }

    #[test]
    fn test_setup_script_polls_with_bound() {
        let net = network();
        let (script, _) = net.setup_script("c-12345678", "10.10.0.7");
        assert!(script.contains(&format!("-lt {}", NETNS_DEV_POLL_ATTEMPTS)));
        assert!(script.contains("sleep 0.1"));
    }
}
