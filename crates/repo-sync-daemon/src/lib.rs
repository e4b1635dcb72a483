//! repo-sync-daemon library: host-side collaborators for the sync engine.
//!
//! Exposes the native file system, file watcher, GitHub transport and state
//! persistence so integration tests can drive them directly.

pub mod github;
pub mod native_fs;
pub mod persistence;
pub mod watcher;

pub use github::GitHubRemote;
pub use native_fs::NativeFs;
pub use persistence::StateStorage;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
