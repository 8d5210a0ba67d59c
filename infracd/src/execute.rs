//! Command dispatch against an assembled workspace.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::forbidden::{ForbiddenOperation, ForbiddenOperationsFile, check_plan};
use crate::core::types::Command;
use crate::error::{Categorize, RunError};
use crate::io::config::{BackendMigration, Timeouts};
use crate::io::fs::{copy_private_file, find_files};
use crate::io::source::resolve_path;
use crate::io::terraform::Provisioner;

/// Plan file written inside the workspace.
pub const PLAN_FILE: &str = "infracd-plan";

/// File name pattern of forbidden-operations rule files.
pub const FORBIDDEN_OPERATIONS_PATTERN: &str = "*.infracd-fo.yml";

/// What a command did to the managed infrastructure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Execution {
    /// The plan contained changes.
    pub has_changes: bool,
    /// Changes were applied or destroyed.
    pub applied: bool,
}

/// Everything a command needs besides the provisioner.
pub struct Executor<'a> {
    pub provisioner: &'a dyn Provisioner,
    pub work: &'a Path,
    /// Resolves relative paths in `backend_migration`.
    pub root: &'a Path,
    pub timeouts: &'a Timeouts,
    pub backend_migration: &'a BackendMigration,
}

impl Executor<'_> {
    #[instrument(skip_all, fields(command = %command))]
    pub fn run(&self, command: Command) -> Result<Execution> {
        match command {
            Command::Plan => Ok(Execution {
                has_changes: self.plan()?,
                applied: false,
            }),
            Command::Apply => self.apply(),
            Command::Destroy => self.destroy(),
            Command::MigrateBackend => self.migrate_backend(),
            Command::Wait => {
                let duration = self.timeouts.wait_duration();
                info!(duration = ?duration, "waiting");
                thread::sleep(duration);
                Ok(Execution::default())
            }
        }
    }

    fn init(&self) -> Result<()> {
        self.provisioner
            .init(self.work, self.timeouts.terraform_init)
    }

    /// Init and plan, then enforce the forbidden-operations rules.
    fn plan(&self) -> Result<bool> {
        self.init()?;
        let has_changes =
            self.provisioner
                .plan(self.work, PLAN_FILE, self.timeouts.terraform_plan)?;
        if !has_changes {
            info!("no changes planned");
            return Ok(false);
        }
        let rules = load_forbidden_operations(self.work)?;
        if rules.is_empty() {
            debug!("no forbidden operations declared");
        } else {
            let changes = self.provisioner.show_plan(self.work, PLAN_FILE)?;
            check_plan(&changes, &rules)?;
            debug!(changes = changes.len(), rules = rules.len(), "planned changes allowed");
        }
        info!("changes planned");
        Ok(true)
    }

    fn apply(&self) -> Result<Execution> {
        if !self.plan()? {
            return Ok(Execution::default());
        }
        self.provisioner
            .apply(self.work, PLAN_FILE, self.timeouts.terraform_apply)?;
        Ok(Execution {
            has_changes: true,
            applied: true,
        })
    }

    fn destroy(&self) -> Result<Execution> {
        self.init()?;
        self.provisioner
            .destroy(self.work, self.timeouts.terraform_destroy)?;
        Ok(Execution {
            has_changes: true,
            applied: true,
        })
    }

    /// Swap the backend file and re-initialize so the tool migrates its state.
    fn migrate_backend(&self) -> Result<Execution> {
        self.init()?;
        self.swap_backend()
            .context("swap backend files")
            .categorize(RunError::WorkspaceIo)?;
        self.init()?;
        info!("backend migrated");
        Ok(Execution {
            has_changes: true,
            applied: true,
        })
    }

    fn swap_backend(&self) -> Result<()> {
        let current = self.work.join(&self.backend_migration.current_backend);
        match fs::remove_file(&current) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(file = %current.display(), "current backend file already absent");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("remove {}", current.display()));
            }
        }
        let next = resolve_path(self.root, &self.backend_migration.next_backend);
        let name = next
            .file_name()
            .with_context(|| format!("next backend {} has no file name", next.display()))?;
        copy_private_file(&next, &self.work.join(name))
    }
}

/// Every rule from the forbidden-operations files found in `work`.
pub fn load_forbidden_operations(work: &Path) -> Result<Vec<ForbiddenOperation>> {
    let files: Vec<PathBuf> = find_files(work, FORBIDDEN_OPERATIONS_PATTERN)
        .categorize(RunError::WorkspaceIo)?;
    let mut rules = Vec::new();
    for file in files {
        let raw = fs::read_to_string(&file)
            .with_context(|| format!("read {}", file.display()))
            .categorize(RunError::WorkspaceIo)?;
        let parsed: ForbiddenOperationsFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse forbidden operations file {}", file.display()))
            .categorize(RunError::ConfigValidation)?;
        rules.extend(parsed.forbidden_operations);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forbidden::Action;
    use crate::error::{ErrorKind, kind_of};
    use crate::test_support::{FakeProvisioner, planned_change};

    fn executor<'a>(
        provisioner: &'a FakeProvisioner,
        work: &'a Path,
        timeouts: &'a Timeouts,
        migration: &'a BackendMigration,
    ) -> Executor<'a> {
        Executor {
            provisioner,
            work,
            root: work,
            timeouts,
            backend_migration: migration,
        }
    }

    const RULES: &str = r#"
forbidden_operations:
  - resource_address: null_resource.protected
    operations: [delete]
"#;

    #[test]
    fn forbidden_change_aborts_before_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("protect.infracd-fo.yml"), RULES).expect("write");
        let fake = FakeProvisioner::with_changes(vec![planned_change(
            "null_resource.protected",
            &[Action::Delete, Action::Create],
        )]);
        let timeouts = Timeouts::default();
        let migration = BackendMigration::default();
        let err = executor(&fake, temp.path(), &timeouts, &migration)
            .run(Command::Apply)
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::ForbiddenOperation));
        assert!(err.to_string().contains("null_resource.protected"));
        assert_eq!(fake.calls(), vec!["init", "plan", "show"]);
    }

    #[test]
    fn unrelated_change_is_applied() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("protect.infracd-fo.yml"), RULES).expect("write");
        let fake = FakeProvisioner::with_changes(vec![planned_change(
            "null_resource.other",
            &[Action::Delete],
        )]);
        let timeouts = Timeouts::default();
        let migration = BackendMigration::default();
        let execution = executor(&fake, temp.path(), &timeouts, &migration)
            .run(Command::Apply)
            .expect("apply");
        assert!(execution.applied);
        assert_eq!(fake.calls(), vec!["init", "plan", "show", "apply"]);
    }

    #[test]
    fn plan_without_changes_does_not_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fake = FakeProvisioner::default();
        let timeouts = Timeouts::default();
        let migration = BackendMigration::default();
        let execution = executor(&fake, temp.path(), &timeouts, &migration)
            .run(Command::Apply)
            .expect("apply");
        assert_eq!(execution, Execution::default());
        assert_eq!(fake.calls(), vec!["init", "plan"]);
    }

    #[test]
    fn destroy_skips_forbidden_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("protect.infracd-fo.yml"), RULES).expect("write");
        let fake = FakeProvisioner::default();
        let timeouts = Timeouts::default();
        let migration = BackendMigration::default();
        executor(&fake, temp.path(), &timeouts, &migration)
            .run(Command::Destroy)
            .expect("destroy");
        assert_eq!(fake.calls(), vec!["init", "destroy"]);
    }

    #[test]
    fn migrate_backend_swaps_files_between_inits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let work = temp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");
        fs::write(work.join("backend.tf"), "old").expect("write");
        fs::write(temp.path().join("next_backend.tf"), "new").expect("write");
        let fake = FakeProvisioner::default();
        let timeouts = Timeouts::default();
        let migration = BackendMigration {
            current_backend: "backend.tf".to_string(),
            next_backend: PathBuf::from("next_backend.tf"),
        };
        Executor {
            provisioner: &fake,
            work: &work,
            root: temp.path(),
            timeouts: &timeouts,
            backend_migration: &migration,
        }
        .run(Command::MigrateBackend)
        .expect("migrate");
        assert!(!work.join("backend.tf").exists());
        assert_eq!(
            fs::read_to_string(work.join("next_backend.tf")).expect("read"),
            "new"
        );
        assert_eq!(fake.calls(), vec!["init", "init"]);
    }

    #[test]
    fn malformed_rules_file_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("bad.infracd-fo.yml"),
            "forbidden_operations: [{operations: [explode]}]",
        )
        .expect("write");
        let err = load_forbidden_operations(temp.path()).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::ConfigValidation));
    }
}
