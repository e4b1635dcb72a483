//! Persisted engine state.
//!
//! The host stores this as JSON and hands it back on the next start. The
//! shape is stable: camelCase keys, `branch` optional.

use crate::hash::ContentHash;
use crate::snapshot::{CommitId, FileMode, RemoteSnapshot, TreeEntry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_BRANCH: &str = "main";

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Repository owner is not configured")]
    MissingOwner,

    #[error("Repository name is not configured")]
    MissingRepo,

    #[error("No credential configured for the remote repository")]
    MissingCredential,
}

/// Which repository to sync with, and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Access token presented to the remote store
    #[serde(default)]
    pub credential_material: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
            credential_material: String::new(),
        }
    }
}

impl Settings {
    /// Refuse to start a session without a complete repository address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner.trim().is_empty() {
            return Err(ConfigError::MissingOwner);
        }
        if self.repo.trim().is_empty() {
            return Err(ConfigError::MissingRepo);
        }
        if self.credential_material.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        Ok(())
    }

    /// Branch name, falling back to the default when blank.
    pub fn branch(&self) -> &str {
        if self.branch.trim().is_empty() {
            DEFAULT_BRANCH
        } else {
            &self.branch
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub hash: ContentHash,
    #[serde(default, skip_serializing_if = "FileMode::is_regular")]
    pub mode: FileMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// Whether a first pull has completed
    #[serde(default)]
    pub initialised: bool,
    #[serde(default)]
    pub reference: CommitId,
    #[serde(default)]
    pub tree: BTreeMap<String, TreeRecord>,
    #[serde(default)]
    pub settings: Settings,
}

impl EngineState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> RemoteSnapshot {
        RemoteSnapshot::new(
            self.reference.clone(),
            self.tree.iter().map(|(path, record)| TreeEntry {
                path: path.clone(),
                hash: record.hash.clone(),
                mode: record.mode,
                url: record.url.clone(),
            }),
        )
    }

    pub fn set_snapshot(&mut self, snapshot: &RemoteSnapshot) {
        self.reference = snapshot.reference().clone();
        self.tree = snapshot
            .entries()
            .map(|entry| {
                (
                    entry.path.clone(),
                    TreeRecord {
                        hash: entry.hash.clone(),
                        mode: entry.mode,
                        url: entry.url.clone(),
                    },
                )
            })
            .collect();
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
