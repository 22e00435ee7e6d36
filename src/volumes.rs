//! Named volume store.
//!
//! A volume is nothing but a directory under the volumes root, keyed by
//! name. There is no metadata; existence of the directory is the whole
//! contract.

use crate::constants::validate_id;
use crate::error::{Error, Result};
use crate::executor::Executor;
use std::sync::Arc;
use tracing::info;

/// Create/remove/list for named persistent directories.
pub struct VolumeStore {
    executor: Arc<dyn Executor>,
    volumes_dir: String,
}

impl VolumeStore {
    pub fn new(executor: Arc<dyn Executor>, volumes_dir: impl Into<String>) -> Self {
        Self {
            executor,
            volumes_dir: volumes_dir.into(),
        }
    }

    /// Executor-side path of a named volume.
    pub fn volume_path(&self, name: &str) -> String {
        format!("{}/{}", self.volumes_dir, name)
    }

    /// Creates a volume; fails if it already exists.
    pub async fn create(&self, name: &str) -> Result<()> {
        validate_id(name).map_err(|reason| {
            Error::InvalidArgument(format!("volume name '{}': {}", name, reason))
        })?;
        let dir = self.volume_path(name);
        if self.executor.succeeds(&["test", "-d", &dir]).await {
            return Err(Error::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            });
        }
        info!(volume = name, "creating volume");
        self.executor.run(&["mkdir", "-p", &dir]).await
    }

    /// Removes a volume; fails if it does not exist.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let dir = self.volume_path(name);
        if !self.executor.succeeds(&["test", "-d", &dir]).await {
            return Err(Error::volume_not_found(name));
        }
        info!(volume = name, "removing volume");
        self.executor.run(&["rm", "-rf", &dir]).await
    }

    /// Lists volume names (subdirectories of the volumes root).
    pub async fn list(&self) -> Result<Vec<String>> {
        self.executor
            .run(&["mkdir", "-p", &self.volumes_dir])
            .await?;
        let out = self
            .executor
            .output(&["ls", "-1", &self.volumes_dir])
            .await
            .unwrap_or_default();
        let mut names: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Ensures a volume directory exists (auto-create on first use by
    /// `run`), returning its executor-side path.
    pub async fn ensure(&self, name: &str) -> Result<String> {
        let dir = self.volume_path(name);
        self.executor.run(&["mkdir", "-p", &dir]).await?;
        Ok(dir)
    }
}
