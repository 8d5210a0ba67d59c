//! Recurrence gate: decide whether a run executes or is skipped.
//!
//! The decision is a pure function of the previous recorded occurrence, the
//! configured policy and the candidate occurrence. Callers supply the clock
//! through `candidate.occurrence.timestamp`.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::core::duration;
use crate::core::types::{Command, CommandOccurrence, CommitHash};

/// Recurrence policy from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecurrencePolicy {
    #[serde(deserialize_with = "duration::deserialize")]
    pub min_interval: Duration,
    /// Any change in remote revisions re-enables plan/apply regardless of elapsed time.
    pub git_triggers: bool,
}

impl RecurrencePolicy {
    /// A policy without a positive interval never gates anything.
    pub fn is_defined(&self) -> bool {
        !self.min_interval.is_zero()
    }
}

/// Return true if the candidate should execute.
///
/// `destroy` never recurs once recorded; see the crate docs.
pub fn should_occur(
    previous: Option<&CommandOccurrence>,
    policy: Option<&RecurrencePolicy>,
    candidate: &CommandOccurrence,
) -> bool {
    let Some(policy) = policy.filter(|p| p.is_defined()) else {
        return true;
    };
    let Some(previous) = previous else {
        return true;
    };
    if previous.command != candidate.command {
        return true;
    }

    let repos_changed = !same_commit_hashes(
        &previous.occurrence.commit_hashes,
        &candidate.occurrence.commit_hashes,
    );

    let decision = match candidate.command {
        Command::MigrateBackend => repos_changed,
        Command::Plan | Command::Apply => {
            if policy.git_triggers && repos_changed {
                true
            } else {
                interval_elapsed(previous, candidate, policy.min_interval)
            }
        }
        Command::Destroy => false,
        Command::Wait => true,
    };
    debug!(
        command = %candidate.command,
        repos_changed,
        decision,
        "recurrence decision"
    );
    decision
}

fn interval_elapsed(
    previous: &CommandOccurrence,
    candidate: &CommandOccurrence,
    min_interval: Duration,
) -> bool {
    let Ok(interval) = chrono::Duration::from_std(min_interval) else {
        // Interval too large to represent: it can never have elapsed.
        return false;
    };
    match previous.occurrence.timestamp.checked_add_signed(interval) {
        Some(next_allowed) => next_allowed < candidate.occurrence.timestamp,
        None => false,
    }
}

/// Unordered equality on (url, ref, path, hash).
pub fn same_commit_hashes(a: &[CommitHash], b: &[CommitHash]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let left: HashSet<&CommitHash> = a.iter().collect();
    let right: HashSet<&CommitHash> = b.iter().collect();
    left == right
}
