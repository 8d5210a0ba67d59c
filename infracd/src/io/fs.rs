//! Filesystem helpers: private directories, recursive merges, hashing.
//!
//! Everything the runner copies may hold credentials or state, so copies are
//! created with owner/group-only permissions on unix.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

#[cfg(unix)]
const PRIVATE_DIR_MODE: u32 = 0o770;
#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;

/// Create `dir` (and parents) if missing.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(dir)
            .with_context(|| format!("create directory {}", dir.display()))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))
    }
}

/// Write `contents` to `path` with private permissions.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    set_private(path)
}

/// Copy a single file, creating the destination's parent directory.
pub fn copy_private_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_private_dir(parent)?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
    set_private(dest)
}

/// Atomically replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    ensure_private_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    io::Write::write_all(&mut tmp, contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    set_private(path)
}

#[cfg(unix)]
fn set_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(PRIVATE_FILE_MODE))
        .with_context(|| format!("set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> Result<()> {
    Ok(())
}

/// Recursively copy the contents of `src` into `dest`. Existing files are overwritten.
///
/// Git metadata directories are not copied.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    ensure_private_dir(dest)?;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && entry.file_name() == ".git"));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            ensure_private_dir(&target)?;
        } else {
            copy_private_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Merge each source directory into `dest`, in order. Later sources win.
#[instrument(skip_all, fields(dest = %dest.display(), sources = sources.len()))]
pub fn merge_dirs(dest: &Path, sources: &[PathBuf]) -> Result<()> {
    ensure_private_dir(dest)?;
    for src in sources {
        debug!(src = %src.display(), "merging directory");
        copy_dir(src, dest).with_context(|| format!("merge {}", src.display()))?;
    }
    Ok(())
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
    }
}

/// Find regular files under `root` whose file name matches the glob `pattern`.
///
/// Symlinks to directories are not followed; broken or looping links are skipped.
pub fn find_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher =
        glob::Pattern::new(pattern).with_context(|| format!("invalid pattern '{pattern}'"))?;
    let mut matches = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let is_file = if entry.path_is_symlink() {
            fs::metadata(entry.path()).is_ok_and(|meta| meta.is_file())
        } else {
            entry.file_type().is_file()
        };
        if is_file && matcher.matches(&entry.file_name().to_string_lossy()) {
            matches.push(entry.into_path());
        }
    }
    Ok(matches)
}

/// Hex sha256 of a file's contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Content fingerprint of a directory tree: relative path to file hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirInfo {
    files: BTreeMap<String, String>,
}

impl DirInfo {
    /// Fingerprint `dir`. A missing directory yields an empty fingerprint.
    pub fn of(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        if !dir.exists() {
            return Ok(Self { files });
        }
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            files.insert(
                rel.to_string_lossy().replace('\\', "/"),
                file_sha256(entry.path())?,
            );
        }
        Ok(Self { files })
    }

    pub fn differs(&self, other: &DirInfo) -> bool {
        self != other
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn later_sources_overwrite_earlier_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        let dest = temp.path().join("dest");
        write(&a.join("main.tf"), "from a");
        write(&a.join("only_a.tf"), "a");
        write(&b.join("main.tf"), "from b");
        write(&b.join("nested/deep.tf"), "deep");

        merge_dirs(&dest, &[a, b]).expect("merge");

        assert_eq!(fs::read_to_string(dest.join("main.tf")).expect("read"), "from b");
        assert_eq!(fs::read_to_string(dest.join("only_a.tf")).expect("read"), "a");
        assert_eq!(
            fs::read_to_string(dest.join("nested/deep.tf")).expect("read"),
            "deep"
        );
    }

    #[test]
    fn merging_zero_sources_creates_destination() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("x/y");
        merge_dirs(&dest, &[]).expect("merge");
        assert!(dest.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn copied_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        write(&src.join("secret.tfvars"), "x");
        let dest = temp.path().join("dest");
        copy_dir(&src, &dest).expect("copy");
        let mode = fs::metadata(dest.join("secret.tfvars"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn find_files_matches_file_names_recursively() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp.path().join("a.infracd-fo.yml"), "");
        write(&temp.path().join("mod/b.infracd-fo.yml"), "");
        write(&temp.path().join("mod/other.yml"), "");
        let found = find_files(temp.path(), "*.infracd-fo.yml").expect("find");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.infracd-fo.yml", "b.infracd-fo.yml"]);
    }

    #[test]
    fn dir_info_tracks_content_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("cache");
        assert!(DirInfo::of(&dir).expect("info").is_empty());
        write(&dir.join("p/provider"), "v1");
        let before = DirInfo::of(&dir).expect("info");
        assert!(!before.differs(&DirInfo::of(&dir).expect("info")));
        write(&dir.join("p/provider"), "v2");
        assert!(before.differs(&DirInfo::of(&dir).expect("info")));
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store/state.yml");
        write_atomic(&path, b"one").expect("write");
        write_atomic(&path, b"two").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
    }
}
