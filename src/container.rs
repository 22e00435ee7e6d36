//! Container data model.
//!
//! The types serialized into each container's `config.json`, plus the
//! run-options snapshot the engine keeps so launcher scripts can be
//! regenerated later. `config.json` is the authoritative runtime state;
//! everything the engine knows about a container after a restart comes
//! from decoding these documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Status
// =============================================================================

/// Container lifecycle status.
///
/// Serialized capitalized (`"Running"` / `"Exited"`). The detached
/// launcher script flips the status with a literal `sed` on the JSON
/// text, so the serialized form is part of the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Exited => write!(f, "Exited"),
        }
    }
}

// =============================================================================
// Ports and Mounts
// =============================================================================

/// A host→container TCP port publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port published on the host side.
    pub host: u16,
    /// Port the service listens on inside the container.
    pub container: u16,
}

impl PortMapping {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// A mount request: either a host path bind or a named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path, or a bare volume name (see [`Mount::is_named_volume`]).
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// A source is a named volume iff it contains no `/`, `\` or `.`.
    ///
    /// This heuristic is load-bearing: it is how `-v data:/srv` (volume)
    /// is told apart from `-v ./data:/srv` (bind). It is documented in
    /// the user-facing help and must not change silently.
    pub fn is_named_volume(&self) -> bool {
        !self.source.contains('/') && !self.source.contains('\\') && !self.source.contains('.')
    }
}

// =============================================================================
// Run Options
// =============================================================================

/// Full description of how to run a container.
///
/// Stored verbatim inside `config.json` (as `config`) so `update` can
/// regenerate the launcher script without re-deriving anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Image name (defaults to `alpine` when empty).
    #[serde(default)]
    pub image: String,
    /// Optional user-chosen container name (unique across containers).
    #[serde(default)]
    pub name: String,
    /// Command and arguments; empty means "use the image CMD".
    #[serde(default)]
    pub args: Vec<String>,
    /// Bind mounts and named volumes.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Environment entries forwarded into the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Attach the caller's TTY.
    #[serde(default)]
    pub interactive: bool,
    /// Run in the background with a launcher script and console.log.
    #[serde(default)]
    pub detach: bool,
    /// User to drop to inside the container (empty = image default/root).
    #[serde(default)]
    pub user: String,
    /// Working directory inside the container (empty = image default).
    #[serde(default)]
    pub workdir: String,
    /// Extra `/etc/hosts` entries as `hostname:ip` pairs.
    #[serde(default)]
    pub extra_hosts: Vec<String>,
}

// =============================================================================
// Container
// =============================================================================

/// The `config.json` document: authoritative state of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Unique id; also the directory key under `containers/`.
    pub id: String,
    /// Optional user-chosen alias.
    #[serde(default)]
    pub name: String,
    /// Image the rootfs was extracted from.
    pub image: String,
    /// Display form of the command.
    #[serde(default)]
    pub command: String,
    /// Creation timestamp (RFC3339).
    pub created: DateTime<Utc>,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Assigned bridge IP (e.g. `10.10.0.7`), empty if none.
    #[serde(default)]
    pub ip: String,
    /// The run options this container was created with.
    #[serde(default)]
    pub config: RunOptions,
}

impl Container {
    /// True when the recorded status is `Running`.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

// =============================================================================
// Image Metadata
// =============================================================================

/// Sidecar document stored next to an image tarball.
///
/// Produced by the build engine as it walks instructions; consumed by
/// the runtime to default unspecified run options. A missing sidecar is
/// equivalent to all-empty fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Default user (`USER` instruction).
    #[serde(default)]
    pub user: String,
    /// Default working directory (`WORKDIR` instruction).
    #[serde(default)]
    pub workdir: String,
    /// Accumulated `ENV` entries.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Default command (`CMD` instruction), already in argv form.
    #[serde(default)]
    pub command: Vec<String>,
}

impl ImageMetadata {
    /// Fills unset fields of `opts` from this metadata.
    ///
    /// Caller-supplied values always win; env entries merge with
    /// existing keys taking precedence.
    pub fn apply_defaults(&self, opts: &mut RunOptions) {
        if opts.user.is_empty() {
            opts.user = self.user.clone();
        }
        if opts.workdir.is_empty() {
            opts.workdir = self.workdir.clone();
        }
        for (k, v) in &self.env {
            opts.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if opts.args.is_empty() && !self.command.is_empty() {
            opts.args = self.command.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_capitalized() {
        // The detached launcher rewrites this exact byte sequence.
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Running).unwrap(),
            "\"Running\""
        );
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Exited).unwrap(),
            "\"Exited\""
        );
    }

    #[test]
    fn test_named_volume_heuristic() {
        assert!(Mount::new("data", "/srv").is_named_volume());
        assert!(Mount::new("db_files", "/var/lib/db").is_named_volume());
        assert!(!Mount::new("./data", "/srv").is_named_volume());
        assert!(!Mount::new("C:\\data", "/srv").is_named_volume());
        assert!(!Mount::new("/abs/path", "/srv").is_named_volume());
        assert!(!Mount::new("file.txt", "/srv").is_named_volume());
    }

    #[test]
    fn test_config_json_round_trip() {
        let c = Container {
            id: "c-18f2a9b3".to_string(),
            name: "web".to_string(),
            image: "alpine".to_string(),
            command: "echo hi".to_string(),
            created: Utc::now(),
            status: ContainerStatus::Running,
            ports: vec![PortMapping::new(8080, 80)],
            ip: "10.10.0.5".to_string(),
            config: RunOptions {
                image: "alpine".to_string(),
                name: "web".to_string(),
                args: vec!["echo".to_string(), "hi".to_string()],
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"status\":\"Running\""));

        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.ip, "10.10.0.5");
        assert_eq!(back.ports, c.ports);
        assert_eq!(back.config.args, c.config.args);
    }

    #[test]
    fn test_metadata_defaults_do_not_override() {
        let meta = ImageMetadata {
            user: "app".to_string(),
            workdir: "/srv".to_string(),
            env: HashMap::from([
                ("A".to_string(), "from-image".to_string()),
                ("B".to_string(), "image-only".to_string()),
            ]),
            command: vec!["sh".to_string()],
        };

        let mut opts = RunOptions {
            user: "root".to_string(),
            env: HashMap::from([("A".to_string(), "from-caller".to_string())]),
            args: vec!["echo".to_string()],
            ..Default::default()
        };

        meta.apply_defaults(&mut opts);
        assert_eq!(opts.user, "root"); // caller wins
        assert_eq!(opts.workdir, "/srv"); // filled in
        assert_eq!(opts.env["A"], "from-caller");
        assert_eq!(opts.env["B"], "image-only");
        assert_eq!(opts.args, vec!["echo"]); // caller args win
    }

    #[test]
    fn test_missing_sidecar_equivalent() {
        // Decoding "{}" yields all-empty metadata, matching the absent-file default.
        let meta: ImageMetadata = serde_json::from_str("{}").unwrap();
        assert!(meta.user.is_empty());
        assert!(meta.command.is_empty());
    }
}
