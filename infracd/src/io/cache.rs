//! Provider cache keyed by the hash of a version manifest.
//!
//! The cache is the provider lock file plus the provider plugin directory. It
//! is restored into the workspace only when the version manifest is unchanged
//! since the last successful run, and persisted again after a run succeeds.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::fs::{
    DirInfo, copy_dir, copy_private_file, ensure_private_dir, file_sha256, merge_dirs,
    remove_dir_if_exists,
};
use super::objstore::{self, S3Config};
use crate::core::types::CacheInfo;
use crate::error::{Categorize, RunError};

const LOCK_FILE: &str = ".terraform.lock.hcl";
const PROVIDERS_DIR: &str = ".terraform/providers";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version manifest, relative to the assembled workspace.
    pub versions_file: PathBuf,
    /// Optional remote copy of the cache directory.
    pub s3: Option<S3Config>,
}

impl CacheConfig {
    pub fn is_defined(&self) -> bool {
        !self.versions_file.as_os_str().is_empty()
    }

    fn remote(&self) -> Option<&S3Config> {
        self.s3.as_ref().filter(|s3| s3.is_defined())
    }

    /// Hash the versions file and restore the cache into `work` on a match.
    ///
    /// Returns the observed [`CacheInfo`] and a fingerprint of `cache_dir` to
    /// compare against in [`CacheConfig::save`].
    #[instrument(skip_all, fields(versions_file = %self.versions_file.display()))]
    pub fn load(
        &self,
        work: &Path,
        cache_dir: &Path,
        previous: &CacheInfo,
    ) -> Result<(CacheInfo, DirInfo)> {
        self.load_inner(work, cache_dir, previous)
            .categorize(RunError::CacheSync)
    }

    fn load_inner(
        &self,
        work: &Path,
        cache_dir: &Path,
        previous: &CacheInfo,
    ) -> Result<(CacheInfo, DirInfo)> {
        let current = CacheInfo {
            versions_hash: versions_hash(&work.join(&self.versions_file))?,
        };
        if !current.should_use(previous) {
            debug!(
                current = %current.versions_hash,
                previous = %previous.versions_hash,
                "provider cache not reusable"
            );
            return Ok((current, DirInfo::of(cache_dir)?));
        }

        if let Some(remote) = self.remote() {
            objstore::sync_to_fs(remote, cache_dir).context("pull provider cache from s3")?;
        }
        ensure_private_dir(cache_dir)?;
        merge_dirs(work, &[cache_dir.to_path_buf()]).context("restore provider cache")?;
        let snapshot = DirInfo::of(cache_dir)?;
        info!(versions_hash = %current.versions_hash, "provider cache restored");
        Ok((current, snapshot))
    }

    /// Copy the lock file and providers out of `work` and push them if changed.
    #[instrument(skip_all, fields(cache_dir = %cache_dir.display()))]
    pub fn save(&self, work: &Path, cache_dir: &Path, snapshot: &DirInfo) -> Result<()> {
        self.save_inner(work, cache_dir, snapshot)
            .categorize(RunError::CacheSync)
    }

    fn save_inner(&self, work: &Path, cache_dir: &Path, snapshot: &DirInfo) -> Result<()> {
        let lock_file = work.join(LOCK_FILE);
        let providers = work.join(PROVIDERS_DIR);
        if !lock_file.is_file() || !providers.is_dir() {
            debug!("no lock file or providers in workspace, cache left untouched");
            return Ok(());
        }

        ensure_private_dir(cache_dir)?;
        copy_private_file(&lock_file, &cache_dir.join(LOCK_FILE))?;
        let cached_providers = cache_dir.join(PROVIDERS_DIR);
        remove_dir_if_exists(&cached_providers)?;
        copy_dir(&providers, &cached_providers).context("copy providers into cache")?;

        let Some(remote) = self.remote() else {
            return Ok(());
        };
        let current = DirInfo::of(cache_dir)?;
        if !current.differs(snapshot) {
            debug!("provider cache unchanged, skipping push");
            return Ok(());
        }
        objstore::sync_from_fs(remote, cache_dir).context("push provider cache to s3")?;
        info!("provider cache pushed");
        Ok(())
    }
}

/// Hex sha256 of the versions file, or empty when it does not exist.
fn versions_hash(path: &Path) -> Result<String> {
    if !path.is_file() {
        warn!(path = %path.display(), "versions file not found, provider cache disabled");
        return Ok(String::new());
    }
    file_sha256(path)
}
