//! End-to-end runs driven through `run::execute` with a scripted provisioner.
//!
//! Each test builds a runner root in a temp dir, so no real terraform, state
//! backend or network is involved.

use std::fs;
use std::time::Duration;

use infracd::core::forbidden::Action;
use infracd::core::recurrence::RecurrencePolicy;
use infracd::core::types::{Command, RunOutcome};
use infracd::error::{ErrorKind, kind_of};
use infracd::exit_codes;
use infracd::io::hooks::{HookCommand, TerminationHook};
use infracd::io::state_store::FsStoreConfig;
use infracd::run::{execute, run_with_state};
use infracd::test_support::{
    FakeProvisioner, dir_config, init_git_repo, planned_change, repo_source, write_file,
};

/// Plan on a single directory source without recurrence or a state store.
#[test]
fn plan_on_dir_source_succeeds_without_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = dir_config(temp.path());
    config.command = Command::Plan;
    let paths = config.paths();

    let fake = FakeProvisioner::with_changes(vec![planned_change(
        "null_resource.a",
        &[Action::Create],
    )]);
    let report = run_with_state(&paths, &config, &fake).expect("run");
    assert_eq!(report.outcome, RunOutcome::Success);
    assert!(report.execution.has_changes);
    assert!(!report.execution.applied);
    assert_eq!(fake.calls(), vec!["init", "plan"]);

    assert!(!paths.work.exists());
    assert!(!paths.fs_store.exists());
    assert_eq!(execute(&config, &fake), exit_codes::OK);
}

/// Two back-to-back applies on an unchanged git source inside the interval:
/// the first applies, the second is skipped and fires the skip hook.
#[cfg(unix)]
#[test]
fn second_apply_within_interval_is_skipped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let origin = temp.path().join("origin");
    init_git_repo(&origin, &[("main.tf", "resource \"null_resource\" \"a\" {}\n")]);

    let mut config = dir_config(temp.path());
    config.sources = vec![repo_source(&origin, "main")];
    config.command = Command::Apply;
    config.state_store.fs = FsStoreConfig { enabled: true };
    config.recurrence = Some(RecurrencePolicy {
        min_interval: Duration::from_secs(60),
        git_triggers: false,
    });
    let marker = temp.path().join("skipped");
    config.termination_hooks.skip = TerminationHook {
        command: Some(HookCommand {
            command: "touch".to_string(),
            args: vec![marker.display().to_string()],
        }),
        http_call: None,
    };

    let first = FakeProvisioner::with_changes(vec![planned_change(
        "null_resource.a",
        &[Action::Create],
    )]);
    assert_eq!(execute(&config, &first), exit_codes::OK);
    assert_eq!(first.calls(), vec!["init", "plan", "apply"]);
    assert!(!marker.exists());

    let second = FakeProvisioner::with_changes(vec![planned_change(
        "null_resource.a",
        &[Action::Create],
    )]);
    assert_eq!(execute(&config, &second), exit_codes::OK);
    assert!(second.calls().is_empty());
    assert!(marker.exists());
    assert!(!config.paths().work.exists());
}

/// A planned delete of a protected resource fails the run before apply.
#[test]
fn forbidden_delete_fails_before_apply() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = dir_config(temp.path());
    config.command = Command::Apply;
    write_file(
        &temp.path().join("src/protect.infracd-fo.yml"),
        "forbidden_operations:\n  - resource_address: null_resource.protected\n    operations: [delete]\n",
    );
    let paths = config.paths();

    let fake = FakeProvisioner::with_changes(vec![planned_change(
        "null_resource.protected",
        &[Action::Delete],
    )]);
    let err = run_with_state(&paths, &config, &fake).unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::ForbiddenOperation));
    assert!(!fake.calls().contains(&"apply".to_string()));

    assert_eq!(execute(&config, &fake), exit_codes::FAILURE);
    assert!(!fake.calls().contains(&"apply".to_string()));
    assert!(!paths.work.exists());
}

/// The failure hook sees failed runs and the state record is left untouched.
#[cfg(unix)]
#[test]
fn failed_run_fires_failure_hook_and_keeps_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = dir_config(temp.path());
    config.state_store.fs = FsStoreConfig { enabled: true };
    let marker = temp.path().join("failed");
    config.termination_hooks.failure = TerminationHook {
        command: Some(HookCommand {
            command: "touch".to_string(),
            args: vec![marker.display().to_string()],
        }),
        http_call: None,
    };

    assert_eq!(execute(&config, &FakeProvisioner::default()), exit_codes::OK);
    let state_file = config.paths().fs_store.join("state.yml");
    let recorded = fs::read_to_string(&state_file).expect("state");

    let failing = FakeProvisioner::default().failing("init");
    assert_eq!(execute(&config, &failing), exit_codes::FAILURE);
    assert!(marker.exists());
    assert_eq!(fs::read_to_string(&state_file).expect("state"), recorded);
}
