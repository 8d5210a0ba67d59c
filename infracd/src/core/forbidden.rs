//! Forbidden-operations gate over planned resource changes.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::RunError;

/// Action a rule may forbid.
///
/// Plans are read with open action strings so actions added by newer tool
/// releases still parse; only rule files are held to this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NoOp,
    Create,
    Read,
    Update,
    Delete,
    Forget,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Forget => "forget",
        }
    }
}

/// One rule from a `*.infracd-fo.yml` file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForbiddenOperation {
    /// Empty matches any provider.
    #[serde(default)]
    pub provider: String,
    pub resource_address: String,
    pub operations: Vec<Action>,
}

/// Top-level shape of a forbidden-operations file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForbiddenOperationsFile {
    #[serde(default)]
    pub forbidden_operations: Vec<ForbiddenOperation>,
}

/// One planned change, reduced to what the gate compares.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceChange {
    pub address: String,
    #[serde(default)]
    pub provider_name: String,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Change {
    /// Action names as reported by `terraform show -json`.
    pub actions: Vec<String>,
}

impl ForbiddenOperation {
    pub fn matches(&self, change: &ResourceChange) -> bool {
        if !self.provider.is_empty() && self.provider != change.provider_name {
            return false;
        }
        if self.resource_address != change.address {
            return false;
        }
        let forbidden: HashSet<&str> = self.operations.iter().map(|op| op.as_str()).collect();
        change
            .change
            .actions
            .iter()
            .any(|a| forbidden.contains(a.as_str()))
    }
}

/// Fail on the first planned change that any rule forbids.
pub fn check_plan(
    changes: &[ResourceChange],
    rules: &[ForbiddenOperation],
) -> Result<(), RunError> {
    for change in changes {
        if rules.iter().any(|rule| rule.matches(change)) {
            return Err(RunError::ForbiddenOperation {
                address: change.address.clone(),
            });
        }
    }
    Ok(())
}
