//! # Port Proxy Manager
//!
//! Makes published container ports reachable from the host. Container
//! IPs (`10.10.0.N`) are only routable inside the executor, so the
//! manager listens on the host side and relays each accepted
//! connection through a `socat` spawned in the executor.
//!
//! ## The Loopback-Alias Trick
//!
//! Each container is assigned the loopback alias `127.0.0.N`, where `N`
//! is the last octet of its bridge IP. Listeners bind
//! `127.0.0.N:<hostPort>`, so two containers may both publish port
//! 8080 without colliding — they get distinct loopback addresses.
//!
//! ## Reconciliation
//!
//! Every 5 s the desired set
//! `{ "127.0.0.N:hostPort" → "containerIP:containerPort" }` is
//! recomputed from the running containers. Listeners that are no
//! longer desired are closed (pending connections force-closed);
//! missing ones are started. The manager is the sole owner of the
//! listener table.

use crate::constants::PROXY_SYNC_INTERVAL;
use crate::container::Container;
use crate::executor::Executor;
use crate::runtime::Runtime;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Desired Set
// =============================================================================

/// Computes the desired listener table from container state.
///
/// Only `Running` containers with an assigned bridge IP contribute.
pub fn desired_proxies(containers: &[Container]) -> HashMap<String, String> {
    let mut desired = HashMap::new();
    for c in containers {
        if !c.is_running() || c.ip.is_empty() {
            continue;
        }
        let Some(last_octet) = c.ip.rsplit('.').next().and_then(|o| o.parse::<u8>().ok())
        else {
            continue;
        };
        for p in &c.ports {
            let key = format!("127.0.0.{}:{}", last_octet, p.host);
            desired.insert(key, format!("{}:{}", c.ip, p.container));
        }
    }
    desired
}

// =============================================================================
// Proxy Manager
// =============================================================================

struct ProxyEntry {
    /// RW-locked so a future hot-reload can retarget without tearing
    /// down live connections.
    target: Arc<RwLock<String>>,
    accept_task: JoinHandle<()>,
    conns: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

/// Host-side TCP listener table, reconciled against container state.
pub struct ProxyManager {
    executor: Arc<dyn Executor>,
    proxies: Mutex<HashMap<String, ProxyEntry>>,
}

impl ProxyManager {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the reconcile loop until the task is aborted.
    pub fn spawn(self: Arc<Self>, runtime: Arc<Runtime>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROXY_SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                match runtime.list().await {
                    Ok(containers) => self.reconcile(&containers).await,
                    Err(e) => warn!("proxy sync: listing containers failed: {e}"),
                }
            }
        })
    }

    /// Brings the listener table in line with `containers`.
    pub async fn reconcile(&self, containers: &[Container]) {
        let desired = desired_proxies(containers);
        let mut proxies = self.proxies.lock().await;

        // Close listeners that are no longer wanted.
        let stale: Vec<String> = proxies
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(entry) = proxies.remove(&key) {
                info!(listen = %key, "closing proxy (container stopped)");
                close_entry(entry);
            }
        }

        // Start listeners that are missing.
        for (key, target) in desired {
            if proxies.contains_key(&key) {
                continue;
            }
            let listener = match TcpListener::bind(&key).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(listen = %key, "proxy bind failed: {e}");
                    continue;
                }
            };
            info!(listen = %key, target = %target, "starting proxy");

            let target = Arc::new(RwLock::new(target));
            let conns: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>> =
                Arc::new(std::sync::Mutex::new(Vec::new()));
            let accept_task = tokio::spawn(accept_loop(
                listener,
                self.executor.clone(),
                target.clone(),
                conns.clone(),
            ));

            proxies.insert(
                key,
                ProxyEntry {
                    target,
                    accept_task,
                    conns,
                },
            );
        }
    }

    /// Tears down every listener and force-closes pending connections.
    pub async fn shutdown(&self) {
        let mut proxies = self.proxies.lock().await;
        for (key, entry) in proxies.drain() {
            debug!(listen = %key, "shutting down proxy");
            close_entry(entry);
        }
    }

    /// Number of live listeners (reconcile observability).
    pub async fn active_count(&self) -> usize {
        self.proxies.lock().await.len()
    }

    /// Current target for a listener key, if present.
    pub async fn target_of(&self, key: &str) -> Option<String> {
        let proxies = self.proxies.lock().await;
        match proxies.get(key) {
            Some(entry) => Some(entry.target.read().await.clone()),
            None => None,
        }
    }
}

fn close_entry(entry: ProxyEntry) {
    entry.accept_task.abort();
    let mut conns = entry.conns.lock().expect("proxy conns lock");
    for conn in conns.drain(..) {
        conn.abort();
    }
}

// =============================================================================
// Connection Handling
// =============================================================================

async fn accept_loop(
    listener: TcpListener,
    executor: Arc<dyn Executor>,
    target: Arc<RwLock<String>>,
    conns: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("proxy accept failed: {e}");
                return;
            }
        };
        debug!(%peer, "proxy connection accepted");

        let executor = executor.clone();
        let target = target.clone();
        let handle = tokio::spawn(async move {
            let current = target.read().await.clone();
            if let Err(e) = relay(stream, executor, &current).await {
                debug!(target = %current, "proxy relay ended: {e}");
            }
        });

        let mut guard = conns.lock().expect("proxy conns lock");
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }
}

/// Bridges one accepted connection to `socat - TCP:<target>` inside
/// the executor, copying bytes both ways until either side closes.
async fn relay(
    stream: TcpStream,
    executor: Arc<dyn Executor>,
    target: &str,
) -> std::io::Result<()> {
    let tcp_arg = format!("TCP:{}", target);
    let mut child = executor
        .prepare(&["socat", "-", &tcp_arg])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let mut child_in = child.stdin.take().expect("piped stdin");
    let mut child_out = child.stdout.take().expect("piped stdout");
    let (mut read_half, mut write_half) = stream.into_split();

    // First direction to finish ends the session, matching TCP
    // half-close behavior closely enough for request/response traffic.
    tokio::select! {
        _ = tokio::io::copy(&mut read_half, &mut child_in) => {}
        _ = tokio::io::copy(&mut child_out, &mut write_half) => {}
    }

    let _ = child.kill().await;
    Ok(())
}
