//! Git adapter for repository sources.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every call gets an
//! explicit working directory; the process-wide cwd is never changed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    envs: Vec<(String, OsString)>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            envs: Vec::new(),
        }
    }

    /// Add an environment variable to every git invocation.
    pub fn with_env(mut self, key: &str, value: impl Into<OsString>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone a single branch without tags into the working directory.
    #[instrument(skip_all, fields(url, reference))]
    pub fn clone_branch(&self, url: &str, reference: &str) -> Result<()> {
        let dest = self.workdir.to_string_lossy().to_string();
        debug!(url, reference, "cloning branch");
        let parent = self
            .workdir
            .parent()
            .with_context(|| format!("clone target has no parent {}", self.workdir.display()))?;
        self.run_checked_in(
            parent,
            &[
                "clone",
                "--branch",
                reference,
                "--single-branch",
                "--no-tags",
                "--",
                url,
                &dest,
            ],
        )?;
        Ok(())
    }

    /// Fetch the branch from origin.
    pub fn fetch(&self, reference: &str) -> Result<()> {
        self.run_checked(&["fetch", "--no-tags", "origin", reference])?;
        Ok(())
    }

    /// Fast-forward the checked out branch to `FETCH_HEAD`.
    ///
    /// Returns `Ok(false)` when a fast-forward is impossible.
    pub fn fast_forward(&self) -> Result<bool> {
        let out = self.run(&["merge", "--ff-only", "FETCH_HEAD"])?;
        Ok(out.status.success())
    }

    /// Full hash of HEAD.
    pub fn head_hash(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True if HEAD's signature verifies against the configured keyring.
    pub fn verify_head_signature(&self) -> Result<bool> {
        let out = self.run(&["verify-commit", "HEAD"])?;
        Ok(out.status.success())
    }

    pub(crate) fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub(crate) fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_in(&self.workdir, args)
    }

    fn run_checked_in(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run_in(dir, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_in(&self.workdir, args)
    }

    fn run_in(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// `GIT_SSH_COMMAND` value pinning a key and a known-hosts file.
pub fn ssh_command(key_path: &Path, known_hosts_path: &Path) -> String {
    format!(
        "ssh -i '{}' -o IdentitiesOnly=yes -o UserKnownHostsFile='{}' -o StrictHostKeyChecking=yes",
        key_path.display(),
        known_hosts_path.display()
    )
}
