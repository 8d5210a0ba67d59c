use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::StateStore;
use crate::core::types::State;
use crate::io::fs::{ensure_private_dir, write_atomic};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FsStoreConfig {
    pub enabled: bool,
}

/// State record kept as a YAML file under the runner root.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    path: PathBuf,
}

impl FsStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StateStore for FsStateStore {
    fn initialize(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_private_dir(parent)?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<State> {
        if !self.path.exists() {
            return Ok(State::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read state file {}", self.path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("deserialize state file {}", self.path.display()))
    }

    fn write(&mut self, state: &State) -> Result<()> {
        let raw = serde_yaml::to_string(state).context("serialize state")?;
        write_atomic(&self.path, raw.as_bytes())
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
