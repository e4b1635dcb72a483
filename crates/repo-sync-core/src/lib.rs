//! repo-sync-core: keeps a local file collection in step with a remote git repository.
//!
//! This crate provides:
//! - Git-compatible content hashing for change detection
//! - Change tracking with per-path coalescing
//! - Diff-based pull and blob/tree/commit push against a `RemoteStore`
//! - A commit queue that serializes pushes into ordered commits
//! - `SyncCoordinator`, the facade a host drives
//! - FileSystem and RemoteStore trait abstractions with in-memory doubles

pub mod commit;
pub mod coordinator;
pub mod events;
pub mod fs;
pub mod hash;
pub mod pull;
pub mod queue;
pub mod remote;
pub mod snapshot;
pub mod state;
pub mod tracker;

pub use commit::{CommitBatch, CommitError, CommitOutcome};
pub use coordinator::{PullReport, PushOutcome, SyncCoordinator, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use hash::ContentHash;
pub use pull::{ChangedFile, PullError, PullResult};
pub use queue::CommitQueue;
pub use remote::{InMemoryRemote, NewTreeEntry, RemoteError, RemoteFile, RemoteStore, TreeId};
pub use snapshot::{CommitId, FileMode, RemoteSnapshot, TreeEntry};
pub use state::{ConfigError, EngineState, Settings};
pub use tracker::{ChangeKind, ChangeTracker, Modification, PendingChangeSet};
