//! RemoteStore trait for the content-addressed remote repository.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing (records every call, injectable failures)
//! - `GitHubRemote` (in repo-sync-daemon) - GitHub git-data REST API
//!
//! Every method is a suspension point; none of them retry.

use crate::hash::ContentHash;
use crate::snapshot::{CommitId, FileMode, TreeEntry};

use async_trait::async_trait;
use futures::channel::oneshot;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Failures scoped to a single path; a batch operation may skip them.
    pub fn is_per_path(&self) -> bool {
        matches!(self, RemoteError::NotFound(_) | RemoteError::NotAFile(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Identifier of a tree object in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeId(String);

impl TreeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TreeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File content fetched at the default reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub hash: ContentHash,
}

pub const BLOB_TYPE: &str = "blob";

/// One entry of a tree to be layered on top of a base commit.
///
/// A `None` hash removes the path from the base tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTreeEntry {
    pub path: String,
    pub mode: FileMode,
    pub kind: &'static str,
    pub hash: Option<ContentHash>,
}

impl NewTreeEntry {
    pub fn blob(path: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Regular,
            kind: BLOB_TYPE,
            hash: Some(hash),
        }
    }

    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn tombstone(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Regular,
            kind: BLOB_TYPE,
            hash: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.hash.is_none()
    }
}

/// Remote object-store operations the engine needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current commit of the tracked branch
    async fn get_reference(&self) -> Result<CommitId>;

    /// Flattened (recursive) list of files at `commit`
    async fn get_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>>;

    /// Content of `path` at the tracked branch
    async fn get_content(&self, path: &str) -> Result<RemoteFile>;

    /// Upload a blob, returning its id
    async fn create_blob(&self, content: &[u8]) -> Result<ContentHash>;

    /// Build a tree from the tree of `base` with `entries` applied
    async fn create_tree(&self, base: &CommitId, entries: &[NewTreeEntry]) -> Result<TreeId>;

    /// Create a commit object with a single parent
    async fn create_commit(
        &self,
        message: &str,
        tree: &TreeId,
        parent: &CommitId,
    ) -> Result<CommitId>;

    /// Move the tracked branch to `commit`
    async fn update_reference(&self, commit: &CommitId) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn get_reference(&self) -> Result<CommitId> {
        (**self).get_reference().await
    }

    async fn get_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>> {
        (**self).get_tree(commit).await
    }

    async fn get_content(&self, path: &str) -> Result<RemoteFile> {
        (**self).get_content(path).await
    }

    async fn create_blob(&self, content: &[u8]) -> Result<ContentHash> {
        (**self).create_blob(content).await
    }

    async fn create_tree(&self, base: &CommitId, entries: &[NewTreeEntry]) -> Result<TreeId> {
        (**self).create_tree(base, entries).await
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &TreeId,
        parent: &CommitId,
    ) -> Result<CommitId> {
        (**self).create_commit(message, tree, parent).await
    }

    async fn update_reference(&self, commit: &CommitId) -> Result<()> {
        (**self).update_reference(commit).await
    }
}

// ============================================================================
// In-memory store for tests
// ============================================================================

/// Operation kinds, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetReference,
    GetTree,
    GetContent,
    CreateBlob,
    CreateTree,
    CreateCommit,
    UpdateReference,
}

/// A call observed by `InMemoryRemote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    GetReference,
    GetTree(CommitId),
    GetContent(String),
    CreateBlob(ContentHash),
    CreateTree { base: CommitId, entries: usize },
    CreateCommit { parent: CommitId, message: String },
    UpdateReference(CommitId),
}

impl RemoteCall {
    /// Whether the call writes to the store.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RemoteCall::CreateBlob(_)
                | RemoteCall::CreateTree { .. }
                | RemoteCall::CreateCommit { .. }
                | RemoteCall::UpdateReference(_)
        )
    }
}

/// Tree listing of the in-memory store: path to blob id and mode
type Listing = BTreeMap<String, (ContentHash, FileMode)>;

struct CommitObject {
    tree: TreeId,
    parent: CommitId,
    message: String,
}

#[derive(Default)]
struct RemoteState {
    blobs: HashMap<ContentHash, Vec<u8>>,
    trees: HashMap<TreeId, Listing>,
    commits: HashMap<CommitId, CommitObject>,
    head: CommitId,
    next_seq: u64,
    calls: Vec<RemoteCall>,
    failing: HashMap<RemoteOp, RemoteError>,
    not_files: HashSet<String>,
}

impl RemoteState {
    fn check(&self, op: RemoteOp) -> Result<()> {
        match self.failing.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn tree_of(&self, commit: &CommitId) -> Result<Listing> {
        if commit.is_empty() {
            return Ok(BTreeMap::new());
        }
        let object = self
            .commits
            .get(commit)
            .ok_or_else(|| RemoteError::NotFound(format!("commit {}", commit)))?;
        self.trees
            .get(&object.tree)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("tree {}", object.tree)))
    }

    fn put_tree(&mut self, files: Listing) -> TreeId {
        let listing: String = files
            .iter()
            .map(|(path, (hash, mode))| format!("{} {} {}\n", mode, hash, path))
            .collect();
        let id = TreeId::new(ContentHash::of(listing.as_bytes()).to_string());
        self.trees.insert(id.clone(), files);
        id
    }

    fn put_commit(&mut self, tree: TreeId, parent: CommitId, message: &str) -> CommitId {
        self.next_seq += 1;
        let header = format!(
            "tree {}\nparent {}\nseq {}\n\n{}",
            tree, parent, self.next_seq, message
        );
        let id = CommitId::new(ContentHash::of(header.as_bytes()).to_string());
        self.commits.insert(
            id.clone(),
            CommitObject {
                tree,
                parent,
                message: message.to_string(),
            },
        );
        id
    }
}

/// Content-addressed store kept in memory.
///
/// Starts with a single empty root commit on the tracked branch.
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        let tree = state.put_tree(BTreeMap::new());
        state.head = state.put_commit(tree, CommitId::default(), "Initial commit");
        Self {
            state: Mutex::new(state),
            hold: Mutex::new(None),
        }
    }

    /// Commit directly to the branch, as another writer would.
    ///
    /// `None` content removes the path. Not recorded in the call log.
    pub fn commit_files(&self, files: &[(&str, Option<&str>)], message: &str) -> CommitId {
        let files: Vec<_> = files
            .iter()
            .map(|(path, content)| (*path, content.map(|c| (c, FileMode::Regular))))
            .collect();
        self.commit_files_with_modes(&files, message)
    }

    /// `commit_files` with an explicit mode per added file.
    pub fn commit_files_with_modes(
        &self,
        files: &[(&str, Option<(&str, FileMode)>)],
        message: &str,
    ) -> CommitId {
        let mut state = self.lock();
        let head = state.head.clone();
        let mut tree = state.tree_of(&head).unwrap_or_default();
        for (path, content) in files {
            match content {
                Some((content, mode)) => {
                    let hash = ContentHash::of(content.as_bytes());
                    state.blobs.insert(hash.clone(), content.as_bytes().to_vec());
                    tree.insert(path.to_string(), (hash, *mode));
                }
                None => {
                    tree.remove(*path);
                }
            }
        }
        let tree_id = state.put_tree(tree);
        let commit = state.put_commit(tree_id, head, message);
        state.head = commit.clone();
        commit
    }

    pub fn head(&self) -> CommitId {
        self.lock().head.clone()
    }

    /// Content of `path` at the branch head.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let tree = state.tree_of(&state.head).ok()?;
        let (hash, _) = tree.get(path)?;
        state.blobs.get(hash).cloned()
    }

    /// Mode of `path` at the branch head.
    pub fn mode(&self, path: &str) -> Option<FileMode> {
        let state = self.lock();
        let tree = state.tree_of(&state.head).ok()?;
        tree.get(path).map(|(_, mode)| *mode)
    }

    pub fn parent_of(&self, commit: &CommitId) -> Option<CommitId> {
        self.lock().commits.get(commit).map(|c| c.parent.clone())
    }

    pub fn message_of(&self, commit: &CommitId) -> Option<String> {
        self.lock().commits.get(commit).map(|c| c.message.clone())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_mutation()).count()
    }

    /// Fail every call of `op` with `err` until cleared.
    pub fn fail_on(&self, op: RemoteOp, err: RemoteError) {
        self.lock().failing.insert(op, err);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Report `path` as something other than a file from `get_content`.
    pub fn mark_not_a_file(&self, path: &str) {
        self.lock().not_files.insert(path.to_string());
    }

    /// Park the next `update_reference` until the returned sender fires (or is dropped).
    pub fn hold_next_reference_update(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        tx
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get_reference(&self) -> Result<CommitId> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::GetReference);
        state.check(RemoteOp::GetReference)?;
        Ok(state.head.clone())
    }

    async fn get_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::GetTree(commit.clone()));
        state.check(RemoteOp::GetTree)?;
        let tree = state.tree_of(commit)?;
        Ok(tree
            .into_iter()
            .map(|(path, (hash, mode))| TreeEntry {
                url: Some(format!("memory://blobs/{}", hash)),
                path,
                hash,
                mode,
            })
            .collect())
    }

    async fn get_content(&self, path: &str) -> Result<RemoteFile> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::GetContent(path.to_string()));
        state.check(RemoteOp::GetContent)?;
        if state.not_files.contains(path) {
            return Err(RemoteError::NotAFile(path.to_string()));
        }
        let tree = state.tree_of(&state.head)?;
        let (hash, _) = tree
            .get(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let content = state
            .blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("blob {}", hash)))?;
        Ok(RemoteFile {
            content,
            hash: hash.clone(),
        })
    }

    async fn create_blob(&self, content: &[u8]) -> Result<ContentHash> {
        let mut state = self.lock();
        let hash = ContentHash::of(content);
        state.calls.push(RemoteCall::CreateBlob(hash.clone()));
        state.check(RemoteOp::CreateBlob)?;
        state.blobs.insert(hash.clone(), content.to_vec());
        Ok(hash)
    }

    async fn create_tree(&self, base: &CommitId, entries: &[NewTreeEntry]) -> Result<TreeId> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::CreateTree {
            base: base.clone(),
            entries: entries.len(),
        });
        state.check(RemoteOp::CreateTree)?;
        let mut tree = state.tree_of(base)?;
        for entry in entries {
            match &entry.hash {
                Some(hash) => {
                    if !state.blobs.contains_key(hash) {
                        return Err(RemoteError::NotFound(format!("blob {}", hash)));
                    }
                    tree.insert(entry.path.clone(), (hash.clone(), entry.mode));
                }
                None => {
                    if tree.remove(&entry.path).is_none() {
                        return Err(RemoteError::NotFound(entry.path.clone()));
                    }
                }
            }
        }
        Ok(state.put_tree(tree))
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &TreeId,
        parent: &CommitId,
    ) -> Result<CommitId> {
        let mut state = self.lock();
        state.calls.push(RemoteCall::CreateCommit {
            parent: parent.clone(),
            message: message.to_string(),
        });
        state.check(RemoteOp::CreateCommit)?;
        if !state.trees.contains_key(tree) {
            return Err(RemoteError::NotFound(format!("tree {}", tree)));
        }
        if !parent.is_empty() && !state.commits.contains_key(parent) {
            return Err(RemoteError::NotFound(format!("commit {}", parent)));
        }
        Ok(state.put_commit(tree.clone(), parent.clone(), message))
    }

    async fn update_reference(&self, commit: &CommitId) -> Result<()> {
        let hold = self.hold.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hold) = hold {
            // A dropped sender releases the hold as well
            let _ = hold.await;
        }

        let mut state = self.lock();
        state.calls.push(RemoteCall::UpdateReference(commit.clone()));
        state.check(RemoteOp::UpdateReference)?;
        let parent = state
            .commits
            .get(commit)
            .map(|c| c.parent.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("commit {}", commit)))?;
        if parent != state.head {
            return Err(RemoteError::Transport(format!(
                "Update is not a fast forward: {} does not descend from {}",
                commit, state.head
            )));
        }
        state.head = commit.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_round_trip() {
        let remote = InMemoryRemote::new();
        let base = remote.get_reference().await.unwrap();

        let hash = remote.create_blob(b"# Note").await.unwrap();
        assert_eq!(hash, ContentHash::of(b"# Note"));

        let tree = remote
            .create_tree(&base, &[NewTreeEntry::blob("note.md", hash.clone())])
            .await
            .unwrap();
        let commit = remote.create_commit("add note", &tree, &base).await.unwrap();
        remote.update_reference(&commit).await.unwrap();

        assert_eq!(remote.head(), commit);
        assert_eq!(remote.parent_of(&commit), Some(base));
        let files = remote.get_tree(&commit).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "note.md");
        assert_eq!(files[0].hash, hash);
        assert_eq!(remote.get_content("note.md").await.unwrap().content, b"# Note");
    }

    #[tokio::test]
    async fn test_tombstone_removes_path() {
        let remote = InMemoryRemote::new();
        let base = remote.commit_files(&[("a.md", Some("a")), ("b.md", Some("b"))], "seed");

        let tree = remote
            .create_tree(&base, &[NewTreeEntry::tombstone("a.md")])
            .await
            .unwrap();
        let commit = remote.create_commit("rm a", &tree, &base).await.unwrap();
        let paths: Vec<_> = remote
            .get_tree(&commit)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["b.md"]);
    }

    #[tokio::test]
    async fn test_reference_update_must_fast_forward() {
        let remote = InMemoryRemote::new();
        let base = remote.get_reference().await.unwrap();
        let hash = remote.create_blob(b"x").await.unwrap();
        let tree = remote
            .create_tree(&base, &[NewTreeEntry::blob("x.md", hash)])
            .await
            .unwrap();
        let commit = remote.create_commit("x", &tree, &base).await.unwrap();

        // Someone else moves the branch first
        remote.commit_files(&[("y.md", Some("y"))], "external");

        let err = remote.update_reference(&commit).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[tokio::test]
    async fn test_content_errors_are_per_path() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("dir.md", Some("x"))], "seed");
        remote.mark_not_a_file("dir.md");

        let missing = remote.get_content("missing.md").await.unwrap_err();
        let not_file = remote.get_content("dir.md").await.unwrap_err();
        assert!(missing.is_per_path());
        assert!(not_file.is_per_path());
        assert!(!RemoteError::Auth("bad token".into()).is_per_path());
    }

    #[tokio::test]
    async fn test_injected_failures_and_call_log() {
        let remote = InMemoryRemote::new();
        remote.fail_on(RemoteOp::CreateBlob, RemoteError::Transport("offline".into()));

        assert!(remote.create_blob(b"x").await.is_err());
        remote.clear_failures();
        assert!(remote.create_blob(b"x").await.is_ok());

        assert_eq!(remote.calls().len(), 2);
        assert_eq!(remote.mutation_count(), 2);
        remote.clear_calls();
        remote.get_reference().await.unwrap();
        assert_eq!(remote.mutation_count(), 0);
    }
}
