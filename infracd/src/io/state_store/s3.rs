use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::{STATE_FILE_NAME, StateStore};
use crate::core::types::State;
use crate::io::objstore::{ObjectStore, S3Config};

/// State record stored as one object under the configured prefix.
pub struct S3StateStore {
    conf: S3Config,
    store: Option<ObjectStore>,
}

impl S3StateStore {
    pub fn new(conf: S3Config) -> Self {
        Self { conf, store: None }
    }

    fn store(&self) -> Result<&ObjectStore> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("s3 state store used before initialization"))
    }
}

impl StateStore for S3StateStore {
    fn initialize(&mut self) -> Result<()> {
        self.store = Some(ObjectStore::connect(&self.conf).context("connect to s3 state store")?);
        Ok(())
    }

    fn read(&mut self) -> Result<State> {
        let key = self.conf.key(STATE_FILE_NAME);
        match self.store()?.get(&key)? {
            None => {
                debug!(key = %key, "no state recorded in s3 yet");
                Ok(State::default())
            }
            Some(raw) => serde_yaml::from_slice(&raw).context("deserialize state from s3"),
        }
    }

    fn write(&mut self, state: &State) -> Result<()> {
        let raw = serde_yaml::to_string(state).context("serialize state")?;
        self.store()?
            .put(&self.conf.key(STATE_FILE_NAME), raw.into_bytes())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.store = None;
        Ok(())
    }
}
