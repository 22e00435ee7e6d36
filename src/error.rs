//! Error types for the container engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// A referenced image, container, or volume does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A volume (or other named resource) already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Caller-supplied input was rejected (bad mount, port, id, Dockerfile).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Image name is not in the supported allow-list.
    #[error("image '{0}' is not supported")]
    Unsupported(String),

    // =========================================================================
    // Executor Errors
    // =========================================================================
    /// The executor ran a command which exited non-zero.
    #[error("executor command failed (exit {status}): {stderr}")]
    ExecutorFailed { status: i32, stderr: String },

    /// The executor could not spawn or converse with a process at all.
    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Bridge or per-container network wiring failed.
    #[error("network setup failed: {0}")]
    NetworkSetupFailed(String),

    /// The IP pool has no free addresses.
    #[error("no available IPs in the container subnet")]
    IpExhausted,

    /// A bounded wait expired (e.g. veth peer never appeared in the netns).
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// A Dockerfile instruction failed during build.
    #[error("build step {step} ({instruction}) failed: {cause}")]
    BuildStepFailed {
        step: usize,
        instruction: String,
        cause: String,
    },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// `export_diff` found the two images identical.
    #[error("no differences found between images '{base}' and '{target}'")]
    NoDifference { base: String, target: String },

    // =========================================================================
    // Path Errors
    // =========================================================================
    /// A host path could not be mapped into the executor.
    #[error("cannot map host path {path}: {reason}")]
    PathMapping { path: PathBuf, reason: String },

    // =========================================================================
    // Serialization / Internal
    // =========================================================================
    /// JSON encode/decode failure (config.json, metadata sidecar).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a missing image.
    pub fn image_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "image",
            name: name.into(),
        }
    }

    /// Shorthand for a missing container.
    pub fn container_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            name: name.into(),
        }
    }

    /// Shorthand for a missing volume.
    pub fn volume_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "volume",
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::container_not_found("web");
        assert_eq!(err.to_string(), "container not found: web");

        let err = Error::BuildStepFailed {
            step: 3,
            instruction: "RUN apk add gcc".to_string(),
            cause: "exit 1".to_string(),
        };
        assert!(err.to_string().contains("step 3"));
        assert!(err.to_string().contains("RUN apk add gcc"));
    }

    #[test]
    fn test_ip_exhausted_display() {
        assert_eq!(
            Error::IpExhausted.to_string(),
            "no available IPs in the container subnet"
        );
    }
}
