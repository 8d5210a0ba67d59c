//! Directory layout under the runner's working directory.

use std::path::PathBuf;

use anyhow::Result;

use super::fs::ensure_private_dir;

/// All canonical directories for a runner root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub root: PathBuf,
    /// Persistent clones of remote repositories.
    pub repos: PathBuf,
    /// Generated backend configuration files.
    pub backend: PathBuf,
    /// Backups of the provisioning tool's local state files.
    pub state: PathBuf,
    /// Filesystem state store.
    pub fs_store: PathBuf,
    /// Provider cache snapshot.
    pub cache: PathBuf,
    /// Ephemeral per-run workspace. Never survives a run.
    pub work: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            repos: root.join("repos"),
            backend: root.join("backend"),
            state: root.join("state"),
            fs_store: root.join("fs-store"),
            cache: root.join("cache"),
            work: root.join("work"),
            root,
        }
    }

    /// Create every persistent directory. `work` is left to the workspace guard.
    pub fn ensure_persistent_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.repos, &self.backend, &self.state, &self.cache] {
            ensure_private_dir(dir)?;
        }
        Ok(())
    }

    /// Location of the tool's local state file inside the workspace and its backup.
    pub fn tfstate_files(&self) -> [(PathBuf, PathBuf); 2] {
        ["terraform.tfstate", "terraform.tfstate.backup"]
            .map(|name| (self.work.join(name), self.state.join(name)))
    }
}
