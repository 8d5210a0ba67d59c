//! Content sources: local directories, git repositories and generated backend files.
//!
//! Sources are declared in configuration as a list of entries that each set
//! exactly one of `dir`, `repo` or `backend_http`. They are converted into the
//! [`Source`] enum at parse time so later stages never see an ambiguous entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minijinja::{Environment, context};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::fs::{ensure_private_dir, find_files, remove_dir_if_exists, write_private};
use super::git::{Git, ssh_command};
use crate::core::types::CommitHash;
use crate::error::RunError;

const BACKEND_HTTP_TEMPLATE: &str = include_str!("templates/backend_http.tf.j2");

/// Number of times a corrupted or diverged clone is deleted and cloned again.
const MAX_RECLONES: usize = 1;

/// One declared content source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSource")]
pub enum Source {
    Dir(PathBuf),
    Repo(GitRepoSource),
    BackendHttp(BackendHttp),
}

/// Configuration shape of a source entry before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    dir: Option<PathBuf>,
    repo: Option<GitRepoSource>,
    backend_http: Option<BackendHttp>,
}

impl TryFrom<RawSource> for Source {
    type Error = String;

    fn try_from(raw: RawSource) -> Result<Self, Self::Error> {
        match (raw.dir, raw.repo, raw.backend_http) {
            (Some(dir), None, None) if !dir.as_os_str().is_empty() => Ok(Source::Dir(dir)),
            (None, Some(repo), None) => Ok(Source::Repo(repo)),
            (None, None, Some(backend)) => Ok(Source::BackendHttp(backend)),
            (None, None, None) => {
                Err("source must define one of 'dir', 'repo' or 'backend_http'".to_string())
            }
            _ => Err(
                "source must define exactly one of 'dir', 'repo' or 'backend_http'".to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GitAuth {
    pub ssh_key_path: PathBuf,
    pub known_hosts_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitRepoSource {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    /// Sub-directory of the repository to use as the source root.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auth: Option<GitAuth>,
    /// Files or directories of armored public keys trusted to sign the head commit.
    #[serde(default)]
    pub gpg_public_keys_paths: Vec<PathBuf>,
}

impl GitRepoSource {
    /// Stable, collision-free directory name for this url and ref.
    pub fn dir_name(&self) -> String {
        STANDARD.encode(format!("{}|{}", self.url, self.reference))
    }

    fn git(&self, dir: &Path) -> Git {
        let git = Git::new(dir);
        match &self.auth {
            Some(auth) => git.with_env(
                "GIT_SSH_COMMAND",
                ssh_command(&auth.ssh_key_path, &auth.known_hosts_path),
            ),
            None => git,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendAddress {
    pub base: String,
    #[serde(default)]
    pub query_string: BTreeMap<String, Vec<String>>,
}

impl BackendAddress {
    /// Base url plus the form-encoded query string (keys sorted).
    pub fn render(&self) -> String {
        if self.query_string.is_empty() {
            return self.base.clone();
        }
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.query_string {
            for value in values {
                query.append_pair(key, value);
            }
        }
        format!("{}?{}", self.base, query.finish())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendHttp {
    pub filename: String,
    pub address: BackendAddress,
    #[serde(default)]
    pub update_method: String,
    #[serde(default)]
    pub lock_address: Option<BackendAddress>,
    #[serde(default)]
    pub lock_method: String,
    #[serde(default)]
    pub unlock_address: Option<BackendAddress>,
    #[serde(default)]
    pub unlock_method: String,
}

impl BackendHttp {
    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("backend_http", BACKEND_HTTP_TEMPLATE)
            .context("load backend template")?;
        let template = env.get_template("backend_http")?;
        let rendered = template
            .render(context! {
                address => self.address.render(),
                update_method => self.update_method,
                lock_address => self.lock_address.as_ref().map(BackendAddress::render),
                lock_method => self.lock_method,
                unlock_address => self.unlock_address.as_ref().map(BackendAddress::render),
                unlock_method => self.unlock_method,
            })
            .context("render backend template")?;
        Ok(rendered)
    }
}

/// Resolve a configured path against the runner root.
pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Directories merged into the workspace, in declaration order.
///
/// Backend sources are not listed; they reach the workspace through the backend directory.
pub fn fs_paths(sources: &[Source], root: &Path, repos_dir: &Path) -> Vec<PathBuf> {
    sources
        .iter()
        .filter_map(|source| match source {
            Source::Dir(dir) => Some(resolve_path(root, dir)),
            Source::Repo(repo) => {
                let dir = repos_dir.join(repo.dir_name());
                Some(if repo.path.is_empty() {
                    dir
                } else {
                    dir.join(&repo.path)
                })
            }
            Source::BackendHttp(_) => None,
        })
        .collect()
}

/// Render every backend source into `backend_dir`.
#[instrument(skip_all, fields(backend_dir = %backend_dir.display()))]
pub fn generate_backend_files(sources: &[Source], backend_dir: &Path) -> Result<()> {
    ensure_private_dir(backend_dir)?;
    for source in sources {
        if let Source::BackendHttp(backend) = source {
            let rendered = backend
                .render()
                .with_context(|| format!("generate backend file {}", backend.filename))?;
            write_private(&backend_dir.join(&backend.filename), rendered.as_bytes())?;
            debug!(filename = %backend.filename, "generated backend file");
        }
    }
    Ok(())
}

/// Synchronize every repository source and return their revisions in declaration order.
#[instrument(skip_all, fields(repos_dir = %repos_dir.display()))]
pub fn sync_repos(sources: &[Source], root: &Path, repos_dir: &Path) -> Result<Vec<CommitHash>> {
    let mut hashes = Vec::new();
    for source in sources {
        if let Source::Repo(repo) = source {
            hashes.push(sync_repo(repo, root, repos_dir)?);
        }
    }
    Ok(hashes)
}

enum SyncAttempt {
    Synced,
    BadDir(String),
}

fn sync_repo(repo: &GitRepoSource, root: &Path, repos_dir: &Path) -> Result<CommitHash> {
    let dir = repos_dir.join(repo.dir_name());
    let git = repo.git(&dir);

    let mut attempt = 0;
    loop {
        match try_sync(&git, repo)? {
            SyncAttempt::Synced => break,
            SyncAttempt::BadDir(reason) if attempt < MAX_RECLONES => {
                warn!(url = %repo.url, reference = %repo.reference, reason = %reason, "deleting repository directory to re-clone");
                remove_dir_if_exists(&dir)
                    .map_err(|err| RunError::SourceSync(format!("{err:#}")))?;
                attempt += 1;
            }
            SyncAttempt::BadDir(reason) => {
                return Err(RunError::SourceSync(format!(
                    "repository {} ({}) is unusable after re-clone: {reason}",
                    repo.url, repo.reference
                ))
                .into());
            }
        }
    }

    let hash = git
        .head_hash()
        .map_err(|err| RunError::SourceSync(format!("{err:#}")))?;

    if !repo.gpg_public_keys_paths.is_empty() {
        verify_signature(&git, repo, root, &hash)?;
    }

    Ok(CommitHash {
        url: repo.url.clone(),
        reference: repo.reference.clone(),
        path: repo.path.clone(),
        hash,
    })
}

fn try_sync(git: &Git, repo: &GitRepoSource) -> Result<SyncAttempt> {
    let dir = git.workdir();
    let source_err = |err: anyhow::Error| {
        RunError::SourceSync(format!(
            "error updating branch \"{}\" of repo \"{}\": {err:#}",
            repo.reference, repo.url
        ))
    };

    if !dir.join(".git").exists() {
        remove_dir_if_exists(dir).map_err(source_err)?;
        if let Some(parent) = dir.parent() {
            ensure_private_dir(parent).map_err(source_err)?;
        }
        git.clone_branch(&repo.url, &repo.reference)
            .map_err(source_err)?;
        info!(url = %repo.url, reference = %repo.reference, "cloned repository");
        return Ok(SyncAttempt::Synced);
    }

    let before = match git.head_hash() {
        Ok(hash) => hash,
        Err(err) => return Ok(SyncAttempt::BadDir(format!("{err:#}"))),
    };
    git.fetch(&repo.reference).map_err(source_err)?;
    if !git.fast_forward().map_err(source_err)? {
        return Ok(SyncAttempt::BadDir("fast-forward impossible".to_string()));
    }
    let after = match git.head_hash() {
        Ok(hash) => hash,
        Err(err) => return Ok(SyncAttempt::BadDir(format!("{err:#}"))),
    };
    if before == after {
        info!(url = %repo.url, reference = %repo.reference, "repository is up to date");
    } else {
        info!(url = %repo.url, reference = %repo.reference, commit = %after, "repository updated");
    }
    Ok(SyncAttempt::Synced)
}

/// Accept HEAD if it verifies against any trusted key file.
fn verify_signature(git: &Git, repo: &GitRepoSource, root: &Path, hash: &str) -> Result<()> {
    let mut key_files = Vec::new();
    for path in &repo.gpg_public_keys_paths {
        let path = resolve_path(root, path);
        let found = find_files(&path, "*")
            .with_context(|| format!("find armored keyrings at {}", path.display()))
            .map_err(|err| RunError::SignatureVerification(format!("{err:#}")))?;
        key_files.extend(found);
    }

    for key_file in &key_files {
        match verify_with_key(git, key_file) {
            Ok(true) => {
                info!(commit = hash, key = %key_file.display(), "head commit signature verified");
                return Ok(());
            }
            Ok(false) => debug!(key = %key_file.display(), "key did not verify head commit"),
            Err(err) => warn!(key = %key_file.display(), err = %format!("{err:#}"), "key could not be used"),
        }
    }

    Err(RunError::SignatureVerification(format!(
        "top commit \"{hash}\" of repo \"{}\" isn't signed with any of the trusted keys",
        repo.url
    ))
    .into())
}

fn verify_with_key(git: &Git, key_file: &Path) -> Result<bool> {
    let home = tempfile::tempdir().context("create temporary gnupg home")?;
    let output = std::process::Command::new("gpg")
        .arg("--batch")
        .arg("--homedir")
        .arg(home.path())
        .arg("--import")
        .arg(key_file)
        .output()
        .context("spawn gpg --import")?;
    if !output.status.success() {
        return Err(anyhow!(
            "gpg --import failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    git.clone()
        .with_env("GNUPGHOME", home.path())
        .verify_head_signature()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_git_repo, repo_source, rewrite_head};
    use std::process::Command as ProcessCommand;

    fn gpg(home: &Path, args: &[&str]) -> Vec<u8> {
        let output = ProcessCommand::new("gpg")
            .arg("--batch")
            .arg("--homedir")
            .arg(home)
            .args(args)
            .output()
            .expect("spawn gpg");
        assert!(
            output.status.success(),
            "gpg {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        output.stdout
    }

    fn gpg_available() -> bool {
        ProcessCommand::new("gpg")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    /// Generate a signing key for `uid` in `home` and return its armored public key.
    fn generate_key(home: &Path, uid: &str) -> Vec<u8> {
        std::fs::create_dir_all(home).expect("mkdir gnupg home");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(home, std::fs::Permissions::from_mode(0o700))
                .expect("chmod gnupg home");
        }
        gpg(
            home,
            &[
                "--pinentry-mode",
                "loopback",
                "--passphrase",
                "",
                "--quick-gen-key",
                uid,
                "ed25519",
                "sign",
                "never",
            ],
        );
        gpg(home, &["--armor", "--export", uid])
    }

    fn parse_sources(yaml: &str) -> Result<Vec<Source>, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn each_entry_must_be_exactly_one_variant() {
        let ok = parse_sources("- dir: ./infra\n- repo: {url: 'git@h:o/r.git', ref: main}\n")
            .expect("parse");
        assert!(matches!(ok[0], Source::Dir(_)));
        assert!(matches!(ok[1], Source::Repo(_)));

        let none = parse_sources("- {}\n").unwrap_err();
        assert!(none.to_string().contains("one of"));
        let both = parse_sources(
            "- dir: ./infra\n  repo: {url: 'git@h:o/r.git', ref: main}\n",
        )
        .unwrap_err();
        assert!(both.to_string().contains("exactly one"));
    }

    #[test]
    fn repo_dir_name_is_base64_of_url_and_ref() {
        let repo = GitRepoSource {
            url: "a".to_string(),
            reference: "b".to_string(),
            path: String::new(),
            auth: None,
            gpg_public_keys_paths: vec![],
        };
        assert_eq!(repo.dir_name(), "YXxi");
    }

    #[test]
    fn backend_address_encodes_sorted_query() {
        let mut query = BTreeMap::new();
        query.insert("z".to_string(), vec!["1".to_string()]);
        query.insert("a b".to_string(), vec!["x&y".to_string()]);
        let address = BackendAddress {
            base: "https://tf.example/state".to_string(),
            query_string: query,
        };
        assert_eq!(address.render(), "https://tf.example/state?a+b=x%26y&z=1");
    }

    #[test]
    fn backend_file_is_rendered_into_backend_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sources = parse_sources(
            r#"
- backend_http:
    filename: backend.tf
    address:
      base: https://tf.example/state
    update_method: PUT
    lock_address:
      base: https://tf.example/lock
"#,
        )
        .expect("parse");
        generate_backend_files(&sources, temp.path()).expect("generate");
        let rendered = std::fs::read_to_string(temp.path().join("backend.tf")).expect("read");
        assert!(rendered.contains("backend \"http\""));
        assert!(rendered.contains("address = \"https://tf.example/state\""));
        assert!(rendered.contains("update_method = \"PUT\""));
        assert!(rendered.contains("lock_address = \"https://tf.example/lock\""));
        assert!(!rendered.contains("unlock_method"));
    }

    #[test]
    fn fs_paths_follow_declaration_order() {
        let root = Path::new("/root-dir");
        let repos = Path::new("/root-dir/repos");
        let sources = parse_sources(
            "- dir: a\n- backend_http: {filename: b.tf, address: {base: x}}\n- repo: {url: u, ref: r, path: sub}\n- dir: /abs\n",
        )
        .expect("parse");
        let paths = fs_paths(&sources, root, repos);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/root-dir/a"),
                PathBuf::from("/root-dir/repos/dXxy/sub"),
                PathBuf::from("/abs"),
            ]
        );
    }

    #[test]
    fn sync_clones_then_fast_forwards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        let first = init_git_repo(&origin, &[("main.tf", "# v1\n")]);
        let repos = temp.path().join("repos");
        let source = Source::Repo(GitRepoSource {
            url: origin.to_string_lossy().to_string(),
            reference: "main".to_string(),
            path: String::new(),
            auth: None,
            gpg_public_keys_paths: vec![],
        });

        let hashes = sync_repos(std::slice::from_ref(&source), temp.path(), &repos).expect("sync");
        assert_eq!(hashes[0].hash, first);

        let second = crate::test_support::commit_file(&origin, "main.tf", "# v2\n");
        let hashes = sync_repos(std::slice::from_ref(&source), temp.path(), &repos).expect("sync");
        assert_eq!(hashes[0].hash, second);
        assert_ne!(first, second);
    }

    #[test]
    fn corrupted_clone_is_recloned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        let head = init_git_repo(&origin, &[("main.tf", "# v1\n")]);
        let repos = temp.path().join("repos");
        let repo = GitRepoSource {
            url: origin.to_string_lossy().to_string(),
            reference: "main".to_string(),
            path: String::new(),
            auth: None,
            gpg_public_keys_paths: vec![],
        };
        let clone_dir = repos.join(repo.dir_name());
        std::fs::create_dir_all(clone_dir.join(".git")).expect("mkdir");
        std::fs::write(clone_dir.join(".git/HEAD"), "garbage").expect("write");

        let hashes = sync_repos(&[Source::Repo(repo)], temp.path(), &repos).expect("sync");
        assert_eq!(hashes[0].hash, head);
    }

    #[test]
    fn unreachable_remote_is_a_source_sync_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = Source::Repo(GitRepoSource {
            url: temp.path().join("missing").to_string_lossy().to_string(),
            reference: "main".to_string(),
            path: String::new(),
            auth: None,
            gpg_public_keys_paths: vec![],
        });
        let err = sync_repos(&[source], temp.path(), &temp.path().join("repos")).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::SourceSync)
        );
    }

    #[test]
    fn unsigned_head_fails_signature_verification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        init_git_repo(&origin, &[("main.tf", "# v1\n")]);
        let keys = temp.path().join("keys");
        std::fs::create_dir_all(&keys).expect("mkdir");
        std::fs::write(keys.join("not-a-key.asc"), "not a key").expect("write");
        let source = Source::Repo(GitRepoSource {
            url: origin.to_string_lossy().to_string(),
            reference: "main".to_string(),
            path: String::new(),
            auth: None,
            gpg_public_keys_paths: vec![keys],
        });
        let err = sync_repos(&[source], temp.path(), &temp.path().join("repos")).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::SignatureVerification)
        );
    }

    #[test]
    fn diverged_clone_is_recloned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        let first = init_git_repo(&origin, &[("main.tf", "# v1\n")]);
        let repos = temp.path().join("repos");
        let source = repo_source(&origin, "main");

        let hashes = sync_repos(std::slice::from_ref(&source), temp.path(), &repos).expect("sync");
        assert_eq!(hashes[0].hash, first);

        let rewritten = rewrite_head(&origin, "main.tf", "# rewritten\n");
        assert_ne!(first, rewritten);
        let hashes = sync_repos(std::slice::from_ref(&source), temp.path(), &repos).expect("sync");
        assert_eq!(hashes[0].hash, rewritten);
    }

    #[test]
    fn head_signed_by_one_trusted_key_is_accepted() {
        if !gpg_available() {
            eprintln!("gpg not installed, skipping");
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let signer_home = temp.path().join("gnupg-signer");
        let other_home = temp.path().join("gnupg-other");
        let signer_uid = "infracd signer <signer@example.com>";
        let signer_key = generate_key(&signer_home, signer_uid);
        let other_key = generate_key(&other_home, "infracd other <other@example.com>");

        let keys = temp.path().join("keys");
        std::fs::create_dir_all(&keys).expect("mkdir");
        std::fs::write(keys.join("a-other.asc"), other_key).expect("write");
        std::fs::write(keys.join("b-signer.asc"), signer_key).expect("write");

        let origin = temp.path().join("origin");
        init_git_repo(&origin, &[("main.tf", "# v1\n")]);
        let status = ProcessCommand::new("git")
            .args([
                "-c",
                &format!("user.signingkey={signer_uid}"),
                "commit",
                "-q",
                "-S",
                "--amend",
                "--no-edit",
            ])
            .current_dir(&origin)
            .env("GNUPGHOME", &signer_home)
            .status()
            .expect("spawn git");
        assert!(status.success(), "signing commit failed");

        let mut source = repo_source(&origin, "main");
        if let Source::Repo(repo) = &mut source {
            repo.gpg_public_keys_paths = vec![keys];
        }
        let hashes =
            sync_repos(&[source], temp.path(), &temp.path().join("repos")).expect("verified");
        assert_eq!(hashes.len(), 1);

        for home in [&signer_home, &other_home] {
            let _ = ProcessCommand::new("gpgconf")
                .arg("--kill")
                .arg("gpg-agent")
                .env("GNUPGHOME", home)
                .status();
        }
    }
}
