//! Test-only helpers: a scripted provisioner, git fixtures and config builders.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::time::Duration;

use anyhow::Result;

use crate::core::forbidden::{Action, Change, ResourceChange};
use crate::error::RunError;
use crate::io::config::Config;
use crate::io::source::{GitRepoSource, Source};
use crate::io::terraform::Provisioner;

/// [`Provisioner`] that records calls and answers from a script.
///
/// `init` optionally lays down a lock file and a provider plugin so cache
/// handling can be exercised without the real tool.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    changes: Vec<ResourceChange>,
    providers: bool,
    fail_on: Option<&'static str>,
    expected_files: Vec<String>,
    calls: RefCell<Vec<String>>,
    seen_files: RefCell<Vec<String>>,
}

impl FakeProvisioner {
    /// Plans report changes and `show_plan` returns `changes`.
    pub fn with_changes(changes: Vec<ResourceChange>) -> Self {
        Self {
            changes,
            ..Self::default()
        }
    }

    pub fn with_providers(mut self) -> Self {
        self.providers = true;
        self
    }

    /// Fail the named call (`init`, `plan`, `show`, `apply`, `destroy`).
    pub fn failing(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Record whether `name` exists in the workspace when `init` runs.
    pub fn expect_file(mut self, name: &str) -> Self {
        self.expected_files.push(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn seen_files(&self) -> Vec<String> {
        self.seen_files.borrow().clone()
    }

    fn record(&self, call: &'static str) -> Result<()> {
        self.calls.borrow_mut().push(call.to_string());
        if self.fail_on == Some(call) {
            return Err(RunError::Provisioning(format!("scripted {call} failure")).into());
        }
        Ok(())
    }
}

impl Provisioner for FakeProvisioner {
    fn init(&self, dir: &Path, _timeout: Option<Duration>) -> Result<()> {
        for name in &self.expected_files {
            if dir.join(name).exists() {
                self.seen_files.borrow_mut().push(name.clone());
            }
        }
        self.record("init")?;
        if self.providers {
            write_file(&dir.join(".terraform.lock.hcl"), "# lock\n");
            write_file(
                &dir.join(".terraform/providers/registry.terraform.io/hashicorp/null/3.2.1/linux_amd64/plugin"),
                "binary",
            );
        }
        Ok(())
    }

    fn plan(&self, dir: &Path, plan_file: &str, _timeout: Option<Duration>) -> Result<bool> {
        self.record("plan")?;
        fs::write(dir.join(plan_file), "plan")?;
        Ok(!self.changes.is_empty())
    }

    fn show_plan(&self, _dir: &Path, _plan_file: &str) -> Result<Vec<ResourceChange>> {
        self.record("show")?;
        Ok(self.changes.clone())
    }

    fn apply(&self, _dir: &Path, _plan_file: &str, _timeout: Option<Duration>) -> Result<()> {
        self.record("apply")
    }

    fn destroy(&self, _dir: &Path, _timeout: Option<Duration>) -> Result<()> {
        self.record("destroy")
    }
}

pub fn planned_change(address: &str, actions: &[Action]) -> ResourceChange {
    ResourceChange {
        address: address.to_string(),
        provider_name: "registry.terraform.io/hashicorp/null".to_string(),
        change: Change {
            actions: actions.iter().map(|a| a.as_str().to_string()).collect(),
        },
    }
}

/// Write `contents`, creating parent directories.
pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, contents).expect("write file");
}

/// Config with a single `dir` source at `<base>/src` and the runner root at `<base>/runner`.
pub fn dir_config(base: &Path) -> Config {
    let src = base.join("src");
    write_file(&src.join("main.tf"), "resource \"null_resource\" \"a\" {}\n");
    Config {
        sources: vec![Source::Dir(src)],
        working_directory: base.join("runner"),
        ..Config::default()
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = ProcessCommand::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a repository on branch `main` with one commit of `files`. Returns the head hash.
pub fn init_git_repo(dir: &Path, files: &[(&str, &str)]) -> String {
    fs::create_dir_all(dir).expect("create repo dir");
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.name", "infracd tests"]);
    git(dir, &["config", "user.email", "infracd@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    for (name, contents) in files {
        write_file(&dir.join(name), contents);
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Commit `contents` to `name` on the current branch. Returns the new head hash.
pub fn commit_file(dir: &Path, name: &str, contents: &str) -> String {
    write_file(&dir.join(name), contents);
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", &format!("update {name}")]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Replace the head commit with one that sets `name` to `contents`, leaving
/// clones of the old head unable to fast-forward. Returns the new head hash.
pub fn rewrite_head(dir: &Path, name: &str, contents: &str) -> String {
    write_file(&dir.join(name), contents);
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "--amend", "-m", &format!("rewrite {name}")]);
    git(dir, &["rev-parse", "HEAD"])
}

/// `repo` source entry pointing at a local repository.
pub fn repo_source(origin: &Path, reference: &str) -> Source {
    Source::Repo(GitRepoSource {
        url: origin.to_string_lossy().to_string(),
        reference: reference.to_string(),
        path: String::new(),
        auth: None,
        gpg_public_keys_paths: Vec::<PathBuf>::new(),
    })
}
