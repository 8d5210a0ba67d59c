//! Durable storage of the cross-run [`State`] record.
//!
//! A store holds exactly one serialized record. [`with_state`] brackets a run:
//! initialize, read, run the business logic, write only if it succeeded, and
//! always clean up.

mod etcd;
mod fs;
mod s3;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

pub use self::etcd::{EtcdConfig, EtcdStateStore};
pub use self::fs::{FsStateStore, FsStoreConfig};
pub use self::s3::S3StateStore;
use super::objstore::S3Config;
use super::paths::Paths;
use crate::core::types::State;
use crate::error::{Categorize, RunError};

/// Name of the record inside every backend.
pub const STATE_FILE_NAME: &str = "state.yml";

/// Pluggable durable key/blob store for the state record.
pub trait StateStore {
    fn initialize(&mut self) -> Result<()>;

    /// The stored record, or the zero [`State`] when none exists yet.
    fn read(&mut self) -> Result<State>;

    /// Replace the whole record.
    fn write(&mut self, state: &State) -> Result<()>;

    fn cleanup(&mut self) -> Result<()>;
}

/// `state_store` configuration section. At most one backend may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub fs: FsStoreConfig,
    pub etcd: Option<EtcdConfig>,
    pub s3: Option<S3Config>,
}

impl StateStoreConfig {
    fn defined_backends(&self) -> Vec<&'static str> {
        let mut defined = Vec::new();
        if self.fs.enabled {
            defined.push("fs");
        }
        if self.etcd.as_ref().is_some_and(EtcdConfig::is_defined) {
            defined.push("etcd");
        }
        if self.s3.as_ref().is_some_and(S3Config::is_defined) {
            defined.push("s3");
        }
        defined
    }

    pub fn is_defined(&self) -> bool {
        !self.defined_backends().is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let defined = self.defined_backends();
        if defined.len() > 1 {
            bail!(
                "at most one state store may be defined, found: {}",
                defined.join(", ")
            );
        }
        Ok(())
    }

    /// Build the configured store, if any.
    pub fn open(&self, paths: &Paths) -> Result<Option<Box<dyn StateStore>>> {
        self.validate()?;
        if self.fs.enabled {
            return Ok(Some(Box::new(FsStateStore::new(
                paths.fs_store.join(STATE_FILE_NAME),
            ))));
        }
        if let Some(etcd) = self.etcd.as_ref().filter(|c| c.is_defined()) {
            return Ok(Some(Box::new(EtcdStateStore::new(etcd.clone()))));
        }
        if let Some(s3) = self.s3.as_ref().filter(|c| c.is_defined()) {
            return Ok(Some(Box::new(S3StateStore::new(s3.clone()))));
        }
        Ok(None)
    }
}

/// Run `f` with the previous state and persist the state it returns.
///
/// Without a store, `f` receives the zero state and nothing is persisted. The
/// new state is written only when `f` succeeds; a cleanup failure is fatal
/// only for an otherwise successful run.
#[instrument(skip_all, fields(store = store.is_some()))]
pub fn with_state<T, F>(store: Option<&mut dyn StateStore>, f: F) -> Result<T>
where
    F: FnOnce(State) -> Result<(State, T)>,
{
    let Some(store) = store else {
        debug!("no state store configured, using zero state");
        return f(State::default()).map(|(_, out)| out);
    };

    store
        .initialize()
        .context("initialize state store")
        .categorize(RunError::StateStore)?;

    let mut session = StoreSession {
        store,
        armed: true,
    };
    let outcome = run_bracketed(&mut *session.store, f);

    let cleanup = session
        .release()
        .context("clean up state store")
        .categorize(RunError::StateStore);
    match (outcome, cleanup) {
        (Ok(out), Ok(())) => Ok(out),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => {
            warn!(err = %format!("{cleanup_err:#}"), "state store cleanup failed after run error");
            Err(err)
        }
    }
}

/// An initialized store. Dropping it without [`StoreSession::release`] still
/// cleans up, so an unwinding run releases the store too.
struct StoreSession<'a> {
    store: &'a mut dyn StateStore,
    armed: bool,
}

impl StoreSession<'_> {
    fn release(&mut self) -> Result<()> {
        self.armed = false;
        self.store.cleanup()
    }
}

impl Drop for StoreSession<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.store.cleanup() {
            warn!(err = %format!("{err:#}"), "state store cleanup failed");
        }
    }
}

fn run_bracketed<T, F>(store: &mut dyn StateStore, f: F) -> Result<T>
where
    F: FnOnce(State) -> Result<(State, T)>,
{
    let previous = store
        .read()
        .context("read state")
        .categorize(RunError::StateStore)?;
    let (next, out) = f(previous)?;
    store
        .write(&next)
        .context("write state")
        .categorize(RunError::StateStore)?;
    info!("state persisted");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CacheInfo, Command, CommandOccurrence};
    use crate::error::{ErrorKind, kind_of};
    use anyhow::anyhow;
    use chrono::Utc;

    #[derive(Default)]
    struct MemoryStore {
        record: Option<State>,
        calls: Vec<&'static str>,
        fail_cleanup: bool,
    }

    impl StateStore for MemoryStore {
        fn initialize(&mut self) -> Result<()> {
            self.calls.push("initialize");
            Ok(())
        }
        fn read(&mut self) -> Result<State> {
            self.calls.push("read");
            Ok(self.record.clone().unwrap_or_default())
        }
        fn write(&mut self, state: &State) -> Result<()> {
            self.calls.push("write");
            self.record = Some(state.clone());
            Ok(())
        }
        fn cleanup(&mut self) -> Result<()> {
            self.calls.push("cleanup");
            if self.fail_cleanup {
                return Err(anyhow!("connection reset"));
            }
            Ok(())
        }
    }

    fn applied_state() -> State {
        State {
            last_command_occurrence: Some(CommandOccurrence::new(
                Command::Apply,
                vec![],
                Utc::now(),
            )),
            cache_info: CacheInfo {
                versions_hash: "abc".to_string(),
            },
        }
    }

    #[test]
    fn success_writes_new_state_once() {
        let mut store = MemoryStore::default();
        let next = applied_state();
        let out = with_state(Some(&mut store), |prev| {
            assert_eq!(prev, State::default());
            Ok((next.clone(), 7))
        })
        .expect("run");
        assert_eq!(out, 7);
        assert_eq!(store.record, Some(next));
        assert_eq!(store.calls, vec!["initialize", "read", "write", "cleanup"]);
    }

    #[test]
    fn failed_run_keeps_previous_state() {
        let previous = applied_state();
        let mut store = MemoryStore {
            record: Some(previous.clone()),
            ..MemoryStore::default()
        };
        let err = with_state(Some(&mut store), |_prev| -> Result<(State, ())> {
            Err(RunError::CacheSync("upload failed".to_string()).into())
        })
        .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::CacheSync));
        assert_eq!(store.record, Some(previous.clone()));
        assert_eq!(store.calls, vec!["initialize", "read", "cleanup"]);

        let seen = with_state(Some(&mut store), |prev| Ok((prev.clone(), prev))).expect("run");
        assert_eq!(seen, previous);
    }

    #[test]
    fn cleanup_failure_fails_successful_run() {
        let mut store = MemoryStore {
            fail_cleanup: true,
            ..MemoryStore::default()
        };
        let err = with_state(Some(&mut store), |prev| Ok((prev, ()))).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::StateStore));
    }

    #[test]
    fn no_store_uses_zero_state() {
        let out = with_state(None, |prev| Ok((applied_state(), prev))).expect("run");
        assert_eq!(out, State::default());
    }

    #[test]
    fn more_than_one_backend_is_rejected() {
        let conf: StateStoreConfig = serde_yaml::from_str(
            "fs: {enabled: true}\ns3: {endpoint: minio:9000, bucket: infra}\n",
        )
        .expect("parse");
        assert!(conf.validate().is_err());
    }

    #[test]
    fn panicking_run_still_cleans_up() {
        let mut store = MemoryStore::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_state(Some(&mut store), |_prev| -> Result<(State, ())> {
                panic!("run aborted")
            })
        }));
        assert!(result.is_err());
        assert_eq!(store.calls, vec!["initialize", "read", "cleanup"]);
        assert_eq!(store.record, None);
    }
}
