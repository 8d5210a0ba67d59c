//! Orchestration of a single run.
//!
//! [`execute`] is the whole invocation: jitter, state bracket, run, hooks and
//! metrics, reduced to an exit code. [`run_config`] is the business logic
//! inside the state bracket and is what tests drive directly.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use crate::core::recurrence::should_occur;
use crate::core::types::{Command, CommandOccurrence, RunOutcome, State};
use crate::error::{Categorize, RunError, kind_of};
use crate::execute::{Execution, Executor};
use crate::exit_codes;
use crate::io::config::Config;
use crate::io::metrics::{Provider, discover_providers, encode};
use crate::io::paths::Paths;
use crate::io::source::{fs_paths, generate_backend_files, sync_repos};
use crate::io::state_store::{StateStore, with_state};
use crate::io::terraform::Provisioner;
use crate::workspace::WorkspaceGuard;

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Record to persist. Equals the previous state when skipped.
    pub state: State,
    pub execution: Execution,
    /// Providers found in the workspace, when metrics ask for them.
    pub providers: Vec<Provider>,
}

/// Sync, gate, assemble and execute the configured command.
///
/// The workspace is cleaned up on every path. The returned state is only a
/// proposal; persisting it is up to the caller.
#[instrument(skip_all, fields(command = %config.command, root = %paths.root.display()))]
pub fn run_config(
    paths: &Paths,
    config: &Config,
    provisioner: &dyn Provisioner,
    previous: State,
) -> Result<RunReport> {
    let guard = WorkspaceGuard::acquire(paths)?;
    paths
        .ensure_persistent_dirs()
        .categorize(RunError::WorkspaceIo)?;

    let commit_hashes = sync_repos(&config.sources, &paths.root, &paths.repos)?;
    let candidate = CommandOccurrence::new(config.command, commit_hashes, Utc::now());
    if !should_occur(
        previous.last_command_occurrence.as_ref(),
        config.recurrence(),
        &candidate,
    ) {
        info!("recurrence policy not met, skipping");
        guard.finish()?;
        return Ok(RunReport {
            outcome: RunOutcome::Skipped,
            state: previous,
            execution: Execution::default(),
            providers: Vec::new(),
        });
    }

    generate_backend_files(&config.sources, &paths.backend)
        .categorize(RunError::WorkspaceIo)?;
    guard.assemble(&fs_paths(&config.sources, &paths.root, &paths.repos))?;

    let cache = config.cache().filter(|_| config.command != Command::Wait);
    let mut cache_info = previous.cache_info.clone();
    let mut snapshot = None;
    if let Some(cache) = cache {
        let (current, dir_info) = cache.load(guard.work(), &paths.cache, &previous.cache_info)?;
        cache_info = current;
        snapshot = Some(dir_info);
    }

    let execution = Executor {
        provisioner,
        work: guard.work(),
        root: &paths.root,
        timeouts: &config.timeouts,
        backend_migration: &config.backend_migration,
    }
    .run(config.command)?;

    if let (Some(cache), Some(snapshot)) = (cache, &snapshot) {
        cache.save(guard.work(), &paths.cache, snapshot)?;
    }

    let providers = match config.metrics() {
        Some(metrics) if metrics.include_providers => discover_providers(guard.work())
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "could not list providers");
                Vec::new()
            }),
        _ => Vec::new(),
    };

    guard.finish()?;
    info!(
        has_changes = execution.has_changes,
        applied = execution.applied,
        "run completed"
    );
    Ok(RunReport {
        outcome: RunOutcome::Success,
        state: State {
            last_command_occurrence: Some(candidate),
            cache_info,
        },
        execution,
        providers,
    })
}

/// Run inside the configured state store bracket.
pub fn run_with_state(
    paths: &Paths,
    config: &Config,
    provisioner: &dyn Provisioner,
) -> Result<RunReport> {
    let mut store = config
        .state_store
        .open(paths)
        .categorize(RunError::StateStore)?;
    let store = store.as_deref_mut().map(|s| s as &mut dyn StateStore);
    with_state(store, |previous| {
        let report = run_config(paths, config, provisioner, previous)?;
        Ok((report.state.clone(), report))
    })
}

/// Full invocation. Returns the process exit code.
pub fn execute(config: &Config, provisioner: &dyn Provisioner) -> i32 {
    if let Some(max) = config.random_jitter {
        sleep_jitter(max);
    }

    let paths = config.paths();
    let result = run_with_state(&paths, config, provisioner);
    let (outcome, providers, mut code) = match &result {
        Ok(report) => (report.outcome, report.providers.clone(), exit_codes::OK),
        Err(err) => {
            error!(kind = ?kind_of(err), err = %format!("{err:#}"), "run failed");
            (RunOutcome::Failure, Vec::new(), exit_codes::FAILURE)
        }
    };

    if let Err(err) = config.termination_hooks.run(outcome) {
        error!(err = %format!("{err:#}"), "termination hook failed");
        code = exit_codes::FAILURE;
    }

    if let Some(metrics) = config.metrics() {
        let pushed = encode(config.command, outcome, Utc::now(), &providers)
            .context("encode run metrics")
            .categorize(RunError::Metrics)
            .and_then(|body| metrics.push(body));
        if let Err(err) = pushed {
            error!(err = %format!("{err:#}"), "metrics push failed");
            code = exit_codes::FAILURE;
        }
    }

    info!(outcome = outcome.as_str(), code, "invocation finished");
    code
}

fn sleep_jitter(max: Duration) {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_millis == 0 {
        return;
    }
    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..max_millis));
    debug!(delay = ?delay, "random jitter");
    thread::sleep(delay);
}
