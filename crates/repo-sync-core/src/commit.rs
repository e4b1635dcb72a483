//! Commit pipeline: turns a captured batch of local intents into one remote commit.
//!
//! A run goes through these steps:
//!
//! 1. Read each upserted file and drop it if its hash matches the snapshot
//! 2. Return early, without touching the network, if nothing survived
//! 3. Upload surviving blobs; deletes become tombstone entries
//! 4. Read the branch head, layer a tree on top of it, commit, move the branch
//! 5. Fetch the resulting tree as the new snapshot
//!
//! Moving the branch is the last network call, so a failed run never leaves
//! the reference half-advanced.

use crate::fs::{FileSystem, FsError};
use crate::hash::ContentHash;
use crate::remote::{NewTreeEntry, RemoteError, RemoteStore};
use crate::snapshot::{CommitId, RemoteSnapshot};
use crate::tracker::{Modification, PendingChangeSet};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Failed to read {path}: {source}")]
    Fs {
        path: String,
        #[source]
        source: FsError,
    },

    #[error("Commit run was cancelled before it completed")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CommitError>;

/// How many paths a commit message lists before summarizing the rest.
const MESSAGE_PATH_LIMIT: usize = 3;

/// One captured intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    /// Path whose current local content should be committed
    Upsert { path: String },
    /// Path to remove from the remote tree
    Tombstone { path: String },
}

impl BatchEntry {
    pub fn path(&self) -> &str {
        match self {
            BatchEntry::Upsert { path } | BatchEntry::Tombstone { path } => path,
        }
    }
}

/// Intents captured from the change tracker at the start of a push.
///
/// Immutable once built; entries are in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    entries: Vec<BatchEntry>,
}

impl CommitBatch {
    pub fn from_changes(changes: PendingChangeSet) -> Self {
        let entries = changes
            .into_iter()
            .flat_map(|modification| match modification {
                Modification::Create { path } | Modification::Update { path } => {
                    vec![BatchEntry::Upsert { path }]
                }
                Modification::Delete { path } => vec![BatchEntry::Tombstone { path }],
                // Never stored by the tracker, but keep the desugaring total
                Modification::Rename {
                    path,
                    previous_path,
                } => vec![
                    BatchEntry::Upsert { path },
                    BatchEntry::Tombstone {
                        path: previous_path,
                    },
                ],
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Snapshot after the run (unchanged for a no-op)
    pub snapshot: RemoteSnapshot,
    /// The new commit, if one was made
    pub commit: Option<CommitId>,
    /// Paths that went into the commit
    pub paths: Vec<String>,
    /// Branch head we built on, when it was not the snapshot's reference
    pub diverged_from: Option<CommitId>,
}

impl CommitOutcome {
    fn unchanged(snapshot: &RemoteSnapshot) -> Self {
        Self {
            snapshot: snapshot.clone(),
            commit: None,
            paths: Vec::new(),
            diverged_from: None,
        }
    }

    pub fn reference(&self) -> &CommitId {
        self.snapshot.reference()
    }

    pub fn is_noop(&self) -> bool {
        self.commit.is_none()
    }
}

/// Summarize committed paths: "no files", "updated a, b" or "updated a, b, c and N more".
pub fn commit_message(paths: &[String]) -> String {
    if paths.is_empty() {
        return "no files".to_string();
    }
    let listed = paths
        .iter()
        .take(MESSAGE_PATH_LIMIT)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if paths.len() > MESSAGE_PATH_LIMIT {
        format!(
            "updated {} and {} more",
            listed,
            paths.len() - MESSAGE_PATH_LIMIT
        )
    } else {
        format!("updated {}", listed)
    }
}

enum Staged {
    Upload { path: String, content: Vec<u8> },
    Remove { path: String },
}

impl Staged {
    fn path(&self) -> &str {
        match self {
            Staged::Upload { path, .. } | Staged::Remove { path } => path,
        }
    }
}

/// Read local content and drop every entry that would not change the remote tree.
async fn stage<F: FileSystem + ?Sized>(
    fs: &F,
    snapshot: &RemoteSnapshot,
    batch: &CommitBatch,
) -> Result<Vec<Staged>> {
    let mut staged = Vec::with_capacity(batch.len());

    for entry in batch.entries() {
        match entry {
            BatchEntry::Upsert { path } => match fs.read(path).await {
                Ok(content) => {
                    if snapshot.hash_of(path) == Some(&ContentHash::of(&content)) {
                        debug!("Skipping {} (matches remote)", path);
                        continue;
                    }
                    staged.push(Staged::Upload {
                        path: path.clone(),
                        content,
                    });
                }
                Err(FsError::NotFound(_)) => {
                    // Gone again before the run started
                    if snapshot.contains(path) {
                        staged.push(Staged::Remove { path: path.clone() });
                    } else {
                        debug!("Skipping {} (no longer exists locally)", path);
                    }
                }
                Err(source) => {
                    return Err(CommitError::Fs {
                        path: path.clone(),
                        source,
                    });
                }
            },
            BatchEntry::Tombstone { path } => {
                if snapshot.contains(path) {
                    staged.push(Staged::Remove { path: path.clone() });
                } else {
                    debug!("Skipping delete of {} (not on remote)", path);
                }
            }
        }
    }

    Ok(staged)
}

/// Run one batch against the remote store.
pub async fn run_once<R, F>(
    remote: &R,
    fs: &F,
    snapshot: &RemoteSnapshot,
    batch: &CommitBatch,
) -> Result<CommitOutcome>
where
    R: RemoteStore + ?Sized,
    F: FileSystem + ?Sized,
{
    let staged = stage(fs, snapshot, batch).await?;
    if staged.is_empty() {
        debug!("Nothing to commit ({} intents suppressed)", batch.len());
        return Ok(CommitOutcome::unchanged(snapshot));
    }

    let paths: Vec<String> = staged.iter().map(|s| s.path().to_string()).collect();

    let mut entries = Vec::with_capacity(staged.len());
    for item in staged {
        match item {
            Staged::Upload { path, content } => {
                let hash = remote.create_blob(&content).await?;
                // Keep whatever mode the remote already has for the path
                let mode = snapshot.mode_of(&path);
                entries.push(NewTreeEntry::blob(path, hash).with_mode(mode));
            }
            Staged::Remove { path } => entries.push(NewTreeEntry::tombstone(path)),
        }
    }

    let base = remote.get_reference().await?;
    let diverged_from = if !snapshot.reference().is_empty() && &base != snapshot.reference() {
        warn!(
            "Remote branch moved from {} to {} outside this engine; committing on top of it",
            snapshot.reference(),
            base
        );
        Some(base.clone())
    } else {
        None
    };

    let tree = remote.create_tree(&base, &entries).await?;
    let message = commit_message(&paths);
    let commit = remote.create_commit(&message, &tree, &base).await?;
    remote.update_reference(&commit).await?;
    info!("Committed {} ({})", commit, message);

    let files = remote.get_tree(&commit).await?;
    Ok(CommitOutcome {
        snapshot: RemoteSnapshot::new(commit.clone(), files),
        commit: Some(commit),
        paths,
        diverged_from,
    })
}
