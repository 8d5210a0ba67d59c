//! Termination hooks fired once per run after the outcome is known.

use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::Method;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command};
use crate::core::types::RunOutcome;
use crate::error::{Categorize, RunError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HookCommand {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpCall {
    pub method: String,
    pub endpoint: String,
}

impl HttpCall {
    fn is_defined(&self) -> bool {
        !self.method.is_empty() && !self.endpoint.is_empty()
    }

    fn is_partial(&self) -> bool {
        self.method.is_empty() != self.endpoint.is_empty()
    }
}

/// A single hook: a local command or an HTTP call. The command wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TerminationHook {
    pub command: Option<HookCommand>,
    pub http_call: Option<HttpCall>,
}

impl TerminationHook {
    pub fn is_defined(&self) -> bool {
        self.command.as_ref().is_some_and(|c| !c.command.is_empty())
            || self.http_call.as_ref().is_some_and(HttpCall::is_defined)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.http_call.as_ref().is_some_and(HttpCall::is_partial) {
            bail!("termination hook '{name}': http_call needs both method and endpoint");
        }
        if self.command_to_run().is_some()
            && self.http_call.as_ref().is_some_and(HttpCall::is_defined)
        {
            warn!(
                hook = name,
                "termination hook sets both command and http_call, only the command runs"
            );
        }
        Ok(())
    }

    fn command_to_run(&self) -> Option<&HookCommand> {
        self.command.as_ref().filter(|c| !c.command.is_empty())
    }

    fn fire(&self) -> Result<()> {
        if let Some(cmd) = self.command_to_run() {
            return run_hook_command(cmd);
        }
        match self.http_call.as_ref().filter(|c| c.is_defined()) {
            Some(call) => send_http_call(call),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TerminationHooks {
    pub success: TerminationHook,
    pub failure: TerminationHook,
    pub skip: TerminationHook,
    /// Replaces the outcome-specific hook when defined.
    pub always: TerminationHook,
}

impl TerminationHooks {
    pub fn validate(&self) -> Result<()> {
        self.success.validate("success")?;
        self.failure.validate("failure")?;
        self.skip.validate("skip")?;
        self.always.validate("always")
    }

    /// The one hook that fires for `outcome`.
    pub fn select(&self, outcome: RunOutcome) -> &TerminationHook {
        if self.always.is_defined() {
            return &self.always;
        }
        match outcome {
            RunOutcome::Success => &self.success,
            RunOutcome::Failure => &self.failure,
            RunOutcome::Skipped => &self.skip,
        }
    }

    #[instrument(skip_all, fields(outcome = outcome.as_str()))]
    pub fn run(&self, outcome: RunOutcome) -> Result<()> {
        let hook = self.select(outcome);
        if !hook.is_defined() {
            return Ok(());
        }
        hook.fire().categorize(RunError::Hook)?;
        info!("termination hook completed");
        Ok(())
    }
}

fn run_hook_command(cmd: &HookCommand) -> Result<()> {
    let mut command = Command::new(&cmd.command);
    command.args(&cmd.args);
    let output = run_command(command, None, DEFAULT_OUTPUT_LIMIT_BYTES, true)
        .with_context(|| format!("run hook command '{}'", cmd.command))?;
    if !output.status.success() {
        bail!(
            "hook command '{}' exited with {:?}: {}",
            cmd.command,
            output.status.code(),
            output.stderr_lossy().trim()
        );
    }
    Ok(())
}

fn send_http_call(call: &HttpCall) -> Result<()> {
    let method = Method::from_bytes(call.method.to_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid hook http method '{}'", call.method))?;
    let response = reqwest::blocking::Client::new()
        .request(method, &call.endpoint)
        .send()
        .with_context(|| format!("call hook endpoint {}", call.endpoint))?;
    let status = response.status();
    if !status.is_success() {
        bail!("hook endpoint {} returned {status}", call.endpoint);
    }
    Ok(())
}
