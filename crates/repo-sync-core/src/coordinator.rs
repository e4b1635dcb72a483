//! SyncCoordinator: the session object a host drives.
//!
//! Owns the remote snapshot, the change tracker and the commit queue for one
//! local/remote pairing. The host decides when to call `pull` and `push`;
//! recording a change never triggers network work on its own.

use crate::commit::{self, CommitBatch, CommitError};
use crate::events::{EventBus, SyncEvent, now_millis};
use crate::fs::{FileSystem, FsError};
use crate::pull::{self, ChangedFile, PullError};
use crate::queue::CommitQueue;
use crate::remote::{RemoteError, RemoteStore};
use crate::snapshot::{CommitId, RemoteSnapshot};
use crate::state::{ConfigError, EngineState, Settings};
use crate::tracker::{ChangeKind, ChangeTracker, PendingChangeSet};

use futures::lock::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pull failed: {0}")]
    Pull(#[from] PullError),

    #[error("Push failed: {0}")]
    Commit(#[from] CommitError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What a pull did to the local replica.
#[derive(Debug, Default)]
pub struct PullReport {
    pub written: usize,
    pub deleted: usize,
    /// Local writes or deletes that failed
    pub failed: Vec<(String, FsError)>,
    /// Remote paths whose content could not be fetched
    pub skipped: Vec<(String, RemoteError)>,
    pub reference: CommitId,
}

impl PullReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Result of one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Branch head after the push
    pub reference: CommitId,
    /// The commit this push created, if any
    pub commit: Option<CommitId>,
    pub paths: Vec<String>,
}

pub struct SyncCoordinator<F, R> {
    fs: F,
    remote: R,
    settings: Settings,
    initialised: AtomicBool,
    snapshot: Mutex<RemoteSnapshot>,
    tracker: ChangeTracker,
    queue: CommitQueue<PushOutcome>,
    events: Arc<EventBus>,
}

impl<F: FileSystem, R: RemoteStore> SyncCoordinator<F, R> {
    /// Start a fresh session with an empty snapshot.
    pub fn new(settings: Settings, fs: F, remote: R) -> Result<Self> {
        Self::from_state(EngineState::new(settings), fs, remote)
    }

    /// Resume a session from persisted state.
    pub fn from_state(state: EngineState, fs: F, remote: R) -> Result<Self> {
        state.settings.validate()?;
        let snapshot = state.snapshot();
        debug!(
            "Resuming {}/{} at {:?} ({} files)",
            state.settings.owner,
            state.settings.repo,
            snapshot.reference().as_str(),
            snapshot.len()
        );

        Ok(Self {
            fs,
            remote,
            settings: state.settings,
            initialised: AtomicBool::new(state.initialised),
            snapshot: Mutex::new(snapshot),
            tracker: ChangeTracker::new(),
            queue: CommitQueue::new(),
            events: Arc::new(EventBus::new()),
        })
    }

    /// Export the state the host should persist.
    pub async fn to_state(&self) -> EngineState {
        let snapshot = self.snapshot.lock().await;
        let mut state = EngineState::new(self.settings.clone());
        state.initialised = self.initialised.load(Ordering::Acquire);
        state.set_snapshot(&snapshot);
        state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    pub async fn reference(&self) -> CommitId {
        self.snapshot.lock().await.reference().clone()
    }

    pub async fn snapshot(&self) -> RemoteSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Whether `path` exists in the last-known remote tree.
    pub async fn is_tracked(&self, path: &str) -> bool {
        self.snapshot.lock().await.contains(path)
    }

    /// Intents recorded since the last push.
    pub fn pending_changes(&self) -> PendingChangeSet {
        self.tracker.peek()
    }

    /// Pushes waiting behind the one in flight.
    pub fn queued_pushes(&self) -> usize {
        self.queue.pending()
    }

    pub fn record_change(&self, path: &str, kind: ChangeKind) {
        self.tracker.record(path, &kind);
    }

    /// Bring the local replica up to the remote branch head.
    ///
    /// Individual local write failures are reported, not fatal: the snapshot
    /// always moves to the fetched tree once the remote side succeeded.
    pub async fn pull(&self) -> Result<PullReport> {
        let mut snapshot = self.snapshot.lock().await;

        let result = match pull::pull(&self.remote, &snapshot).await {
            Ok(result) => result,
            Err(err) => {
                self.emit_failure("pull", &err);
                return Err(err.into());
            }
        };

        let mut report = PullReport {
            reference: result.snapshot.reference().clone(),
            skipped: result.skipped,
            ..PullReport::default()
        };

        for change in result.changed {
            let applied = match &change {
                ChangedFile::Updated { path, content, .. } => self.write_local(path, content).await,
                ChangedFile::Removed { path } => self.remove_local(path).await,
            };
            match applied {
                Ok(()) if change.is_removal() => report.deleted += 1,
                Ok(()) => report.written += 1,
                Err(err) => {
                    warn!("Failed to apply {}: {}", change.path(), err);
                    self.events.emit(SyncEvent::FileWriteFailed {
                        path: change.path().to_string(),
                        error: err.to_string(),
                        timestamp: now_millis(),
                    });
                    report.failed.push((change.path().to_string(), err));
                }
            }
        }

        *snapshot = result.snapshot;
        self.initialised.store(true, Ordering::Release);
        drop(snapshot);

        if report.written + report.deleted + report.failed.len() > 0 {
            info!(
                "Pulled {}: {} written, {} deleted, {} failed",
                report.reference,
                report.written,
                report.deleted,
                report.failed.len()
            );
        }
        self.events.emit(SyncEvent::PullApplied {
            reference: report.reference.to_string(),
            written: report.written,
            deleted: report.deleted,
            failed: report.failed.len(),
            timestamp: now_millis(),
        });

        Ok(report)
    }

    /// Commit everything recorded since the last push.
    ///
    /// The recorded intents are handed to the commit queue as one batch. If
    /// the run fails they are not restored; the next edit records them again.
    pub async fn push(&self) -> Result<PushOutcome> {
        let batch = CommitBatch::from_changes(self.tracker.drain());
        debug!("Pushing batch of {} intents", batch.len());

        match self.queue.submit(batch, |b| self.commit_batch(b)).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.emit_failure("push", &err);
                Err(err.into())
            }
        }
    }

    async fn commit_batch(&self, batch: CommitBatch) -> commit::Result<PushOutcome> {
        let mut snapshot = self.snapshot.lock().await;
        let outcome = commit::run_once(&self.remote, &self.fs, &snapshot, &batch).await?;

        if let Some(actual) = &outcome.diverged_from {
            self.events.emit(SyncEvent::RemoteDiverged {
                expected: snapshot.reference().to_string(),
                actual: actual.to_string(),
                timestamp: now_millis(),
            });
        }
        match &outcome.commit {
            Some(commit) => self.events.emit(SyncEvent::CommitCreated {
                commit: commit.to_string(),
                paths: outcome.paths.clone(),
                timestamp: now_millis(),
            }),
            None => self.events.emit(SyncEvent::CommitSkipped {
                intents: batch.len(),
                timestamp: now_millis(),
            }),
        }

        let pushed = PushOutcome {
            reference: outcome.reference().clone(),
            commit: outcome.commit,
            paths: outcome.paths,
        };
        *snapshot = outcome.snapshot;
        Ok(pushed)
    }

    async fn write_local(&self, path: &str, content: &[u8]) -> std::result::Result<(), FsError> {
        if self.fs.exists(path).await? {
            self.fs.write(path, content).await
        } else {
            self.fs.create(path, content).await
        }
    }

    async fn remove_local(&self, path: &str) -> std::result::Result<(), FsError> {
        match self.fs.delete(path).await {
            Err(FsError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    fn emit_failure(&self, operation: &str, err: &dyn std::error::Error) {
        warn!("{} failed: {}", operation, err);
        self.events.emit(SyncEvent::SyncFailed {
            operation: operation.to_string(),
            error: err.to_string(),
            timestamp: now_millis(),
        });
    }
}
