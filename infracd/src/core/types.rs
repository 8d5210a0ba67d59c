//! Shared deterministic types for run orchestration.
//!
//! These types define the persisted cross-run record and the values the
//! recurrence gate compares. They must not depend on I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single command a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    Plan,
    #[default]
    Apply,
    Destroy,
    Wait,
    MigrateBackend,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Plan,
        Command::Apply,
        Command::Destroy,
        Command::Wait,
        Command::MigrateBackend,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Plan => "plan",
            Command::Apply => "apply",
            Command::Destroy => "destroy",
            Command::Wait => "wait",
            Command::MigrateBackend => "migrate_backend",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "invalid command '{s}': valid values are 'plan', 'apply', 'destroy', 'wait' or 'migrate_backend'"
                )
            })
    }
}

impl TryFrom<String> for Command {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(value: Command) -> Self {
        value.as_str().to_string()
    }
}

/// Resolved revision of one remote repository source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitHash {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub path: String,
    pub hash: String,
}

/// State of the world used for one run's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    #[serde(default)]
    pub commit_hashes: Vec<CommitHash>,
    pub timestamp: DateTime<Utc>,
}

/// Unit compared across runs by the recurrence gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOccurrence {
    pub command: Command,
    pub occurrence: Occurrence,
}

impl CommandOccurrence {
    pub fn new(command: Command, commit_hashes: Vec<CommitHash>, now: DateTime<Utc>) -> Self {
        Self {
            command,
            occurrence: Occurrence {
                commit_hashes,
                timestamp: now,
            },
        }
    }
}

/// Fingerprint of the provider cache recorded by the last successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Hex sha256 of the versions file. Empty means "no valid cache recorded".
    #[serde(default)]
    pub versions_hash: String,
}

impl CacheInfo {
    /// True only on an exact match of two non-empty hashes.
    pub fn should_use(&self, previous: &CacheInfo) -> bool {
        !self.versions_hash.is_empty() && self.versions_hash == previous.versions_hash
    }
}

/// The sole persisted cross-run record. Replaced, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub last_command_occurrence: Option<CommandOccurrence>,
    #[serde(default)]
    pub cache_info: CacheInfo,
}

/// How a run ended, as reported to hooks and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Skipped => "skip",
        }
    }
}
