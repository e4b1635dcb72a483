//! Persistence for the engine state.
//!
//! Stores the last-known remote snapshot and repository settings so a restart
//! resumes without re-downloading the whole tree. By default the state lives
//! in `.sync/state.json` within the vault directory.

use anyhow::{Context, Result};
use repo_sync_core::EngineState;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const STATE_DIR: &str = ".sync";
pub const STATE_FILE: &str = "state.json";

/// Storage for the persisted engine state.
pub struct StateStorage {
    path: PathBuf,
}

impl StateStorage {
    /// Storage at `.sync/state.json` within the vault.
    pub fn in_vault(vault_path: &Path) -> Self {
        Self::at(vault_path.join(STATE_DIR).join(STATE_FILE))
    }

    /// Storage at an explicit file path.
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, or a default state if nothing was saved yet.
    pub fn load(&self) -> Result<EngineState> {
        if !self.path.exists() {
            debug!("No state at {}; starting fresh", self.path.display());
            return Ok(EngineState::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        EngineState::from_json(&contents)
            .with_context(|| format!("Malformed state file {}", self.path.display()))
    }

    /// Write the state atomically (temp file + rename).
    pub fn save(&self, state: &EngineState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = state.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
