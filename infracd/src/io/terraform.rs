//! Provisioning tool adapter.
//!
//! [`Provisioner`] is the seam between the run executor and the `terraform`
//! CLI so orchestration can be tested with scripted fakes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, instrument};

use super::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command};
use crate::core::forbidden::ResourceChange;
use crate::error::RunError;

/// Operations the run executor needs from the provisioning tool.
///
/// Every call receives the workspace explicitly. A `timeout` of `None` waits
/// indefinitely.
pub trait Provisioner {
    fn init(&self, dir: &Path, timeout: Option<Duration>) -> Result<()>;

    /// Write a plan to `plan_file`. Returns true if the plan contains changes.
    fn plan(&self, dir: &Path, plan_file: &str, timeout: Option<Duration>) -> Result<bool>;

    /// Planned resource changes recorded in `plan_file`.
    fn show_plan(&self, dir: &Path, plan_file: &str) -> Result<Vec<ResourceChange>>;

    fn apply(&self, dir: &Path, plan_file: &str, timeout: Option<Duration>) -> Result<()>;

    fn destroy(&self, dir: &Path, timeout: Option<Duration>) -> Result<()>;
}

/// [`Provisioner`] backed by the `terraform` binary.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: PathBuf,
    output_limit_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct PlanJson {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1");
        cmd
    }

    fn run(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Option<Duration>,
        output_limit_bytes: usize,
        echo: bool,
    ) -> Result<CommandOutput> {
        let label = args.first().copied().unwrap_or_default();
        let output = run_command(
            self.command(dir, args),
            timeout.filter(|t| !t.is_zero()),
            output_limit_bytes,
            echo,
        )
        .map_err(|err| {
            RunError::Provisioning(format!(
                "error running terraform {label} in directory \"{}\": {err:#}",
                dir.display()
            ))
        })?;
        if output.timed_out {
            return Err(RunError::Provisioning(format!(
                "terraform {label} in directory \"{}\" timed out",
                dir.display()
            ))
            .into());
        }
        Ok(output)
    }

    fn run_checked(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let output = self.run(dir, args, timeout, self.output_limit_bytes, true)?;
        if !output.status.success() {
            return Err(failure(dir, args, &output).into());
        }
        Ok(output)
    }
}

fn failure(dir: &Path, args: &[&str], output: &CommandOutput) -> RunError {
    RunError::Provisioning(format!(
        "error with terraform {} in directory \"{}\" (exit code {:?}): {}",
        args.first().copied().unwrap_or_default(),
        dir.display(),
        output.status.code(),
        output.stderr_lossy().trim()
    ))
}

impl Provisioner for TerraformCli {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    fn init(&self, dir: &Path, timeout: Option<Duration>) -> Result<()> {
        self.run_checked(dir, &["init", "-input=false", "-upgrade"], timeout)?;
        info!("terraform init completed");
        Ok(())
    }

    #[instrument(skip_all, fields(dir = %dir.display(), plan_file))]
    fn plan(&self, dir: &Path, plan_file: &str, timeout: Option<Duration>) -> Result<bool> {
        let out_arg = format!("-out={plan_file}");
        let args = ["plan", "-input=false", "-detailed-exitcode", out_arg.as_str()];
        let output = self.run(dir, &args, timeout, self.output_limit_bytes, true)?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(2) => Ok(true),
            _ => Err(failure(dir, &args, &output).into()),
        }
    }

    #[instrument(skip_all, fields(dir = %dir.display(), plan_file))]
    fn show_plan(&self, dir: &Path, plan_file: &str) -> Result<Vec<ResourceChange>> {
        let args = ["show", "-json", plan_file];
        // The plan document carries full before/after values; it must be read whole.
        let output = self.run(dir, &args, None, usize::MAX, false)?;
        if !output.status.success() {
            return Err(failure(dir, &args, &output).into());
        }
        let plan: PlanJson = serde_json::from_slice(&output.stdout)
            .context("parse terraform show -json output")
            .map_err(|err| RunError::Provisioning(format!("{err:#}")))?;
        Ok(plan.resource_changes)
    }

    #[instrument(skip_all, fields(dir = %dir.display(), plan_file))]
    fn apply(&self, dir: &Path, plan_file: &str, timeout: Option<Duration>) -> Result<()> {
        self.run_checked(dir, &["apply", "-input=false", plan_file], timeout)?;
        info!("terraform apply completed");
        Ok(())
    }

    #[instrument(skip_all, fields(dir = %dir.display()))]
    fn destroy(&self, dir: &Path, timeout: Option<Duration>) -> Result<()> {
        self.run_checked(dir, &["destroy", "-input=false", "-auto-approve"], timeout)?;
        info!("terraform destroy completed");
        Ok(())
    }
}
