//! Ephemeral per-run workspace.
//!
//! `work/` is assembled from the resolved sources, the state backups and the
//! generated backend files, and is always torn down at the end of a run after
//! the provisioning tool's local state has been backed up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

pub use crate::io::fs::merge_dirs;
use crate::error::{Categorize, RunError};
use crate::io::fs::{copy_private_file, remove_dir_if_exists};
use crate::io::paths::Paths;

/// Owns `work/` for the duration of one run.
///
/// Dropping the guard backs up the local state files and removes the
/// workspace, on every exit path. [`WorkspaceGuard::finish`] does the same
/// but reports failures.
#[derive(Debug)]
pub struct WorkspaceGuard {
    paths: Paths,
    armed: bool,
}

impl WorkspaceGuard {
    /// Clean up a workspace left behind by a crashed run, then take ownership.
    pub fn acquire(paths: &Paths) -> Result<Self> {
        if paths.work.exists() {
            warn!(work = %paths.work.display(), "workspace left over from a previous run, recovering");
            cleanup(paths)?;
        }
        Ok(Self {
            paths: paths.clone(),
            armed: true,
        })
    }

    pub fn work(&self) -> &Path {
        &self.paths.work
    }

    /// Merge `sources`, then `state/` and `backend/`, into the workspace.
    pub fn assemble(&self, sources: &[PathBuf]) -> Result<()> {
        assemble(&self.paths, sources)
    }

    pub fn finish(mut self) -> Result<()> {
        self.armed = false;
        cleanup(&self.paths)
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = cleanup(&self.paths) {
            warn!(err = %format!("{err:#}"), "workspace cleanup failed");
        }
    }
}

#[instrument(skip_all, fields(work = %paths.work.display()))]
pub fn assemble(paths: &Paths, sources: &[PathBuf]) -> Result<()> {
    let mut ordered = sources.to_vec();
    ordered.push(paths.state.clone());
    ordered.push(paths.backend.clone());
    merge_dirs(&paths.work, &ordered)
        .context("assemble workspace")
        .categorize(RunError::WorkspaceIo)?;
    info!(sources = sources.len(), "workspace assembled");
    Ok(())
}

/// Back up the local state files out of `work/`, then remove it.
#[instrument(skip_all, fields(work = %paths.work.display()))]
pub fn cleanup(paths: &Paths) -> Result<()> {
    cleanup_inner(paths).categorize(RunError::WorkspaceIo)
}

fn cleanup_inner(paths: &Paths) -> Result<()> {
    for (live, backup) in paths.tfstate_files() {
        if live.is_file() {
            copy_private_file(&live, &backup).context("back up local state")?;
            debug!(file = %backup.display(), "local state backed up");
        }
    }
    remove_dir_if_exists(&paths.work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fs::DirInfo;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn setup() -> (tempfile::TempDir, Paths, Vec<PathBuf>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(temp.path().join("root"));
        paths.ensure_persistent_dirs().expect("dirs");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        write(&a.join("main.tf"), "a");
        write(&a.join("modules/net/main.tf"), "net");
        write(&b.join("main.tf"), "b");
        write(&paths.backend.join("backend.tf"), "backend");
        (temp, paths, vec![a, b])
    }

    #[test]
    fn assembly_is_idempotent() {
        let (_temp, paths, sources) = setup();
        let guard = WorkspaceGuard::acquire(&paths).expect("acquire");
        guard.assemble(&sources).expect("assemble");
        let first = DirInfo::of(&paths.work).expect("info");
        guard.finish().expect("finish");

        let guard = WorkspaceGuard::acquire(&paths).expect("acquire");
        guard.assemble(&sources).expect("assemble");
        let second = DirInfo::of(&paths.work).expect("info");
        assert_eq!(first, second);
        assert_eq!(
            fs::read_to_string(paths.work.join("main.tf")).expect("read"),
            "b"
        );
        assert!(paths.work.join("backend.tf").is_file());
    }

    #[test]
    fn drop_backs_up_state_and_removes_work() {
        let (_temp, paths, sources) = setup();
        {
            let guard = WorkspaceGuard::acquire(&paths).expect("acquire");
            guard.assemble(&sources).expect("assemble");
            write(&guard.work().join("terraform.tfstate"), "{\"serial\": 3}");
        }
        assert!(!paths.work.exists());
        assert_eq!(
            fs::read_to_string(paths.state.join("terraform.tfstate")).expect("backup"),
            "{\"serial\": 3}"
        );
    }

    #[test]
    fn state_backup_is_restored_into_next_workspace() {
        let (_temp, paths, sources) = setup();
        write(&paths.state.join("terraform.tfstate"), "previous");
        let guard = WorkspaceGuard::acquire(&paths).expect("acquire");
        guard.assemble(&sources).expect("assemble");
        assert_eq!(
            fs::read_to_string(guard.work().join("terraform.tfstate")).expect("read"),
            "previous"
        );
    }

    #[test]
    fn stale_workspace_is_recovered() {
        let (_temp, paths, _sources) = setup();
        write(&paths.work.join("terraform.tfstate.backup"), "crashed");
        write(&paths.work.join("leftover.tf"), "x");

        let guard = WorkspaceGuard::acquire(&paths).expect("acquire");
        assert!(!guard.work().exists());
        assert_eq!(
            fs::read_to_string(paths.state.join("terraform.tfstate.backup")).expect("backup"),
            "crashed"
        );
    }
}
