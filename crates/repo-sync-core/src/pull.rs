//! Diff & pull: bring the last-known snapshot up to the remote branch head.
//!
//! Only paths whose blob hash differs from the snapshot are downloaded.
//! Paths that disappeared from the remote tree come back as `Removed` so the
//! caller can delete the local copy. Applying the changes is the caller's job,
//! in the order given: removals come first so a file replaced by a directory
//! of the same name (or the reverse) is cleared before its successor lands.

use crate::hash::ContentHash;
use crate::remote::{RemoteError, RemoteStore};
use crate::snapshot::RemoteSnapshot;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PullError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, PullError>;

/// A path that differs between the snapshot and the remote head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedFile {
    /// New or modified remotely
    Updated {
        path: String,
        content: Vec<u8>,
        hash: ContentHash,
    },
    /// Gone from the remote tree
    Removed { path: String },
}

impl ChangedFile {
    pub fn path(&self) -> &str {
        match self {
            ChangedFile::Updated { path, .. } | ChangedFile::Removed { path } => path,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, ChangedFile::Removed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PullResult {
    /// Removals first, then updates, each in path order
    pub changed: Vec<ChangedFile>,
    /// Paths whose content could not be fetched
    pub skipped: Vec<(String, RemoteError)>,
    pub snapshot: RemoteSnapshot,
}

impl PullResult {
    fn unchanged(snapshot: &RemoteSnapshot) -> Self {
        Self {
            changed: Vec::new(),
            skipped: Vec::new(),
            snapshot: snapshot.clone(),
        }
    }
}

/// Fetch the remote head and diff it against `last_known`.
///
/// Per-path failures (not found, not a file) are collected in `skipped`;
/// anything else aborts the pull and leaves the caller's snapshot in charge.
pub async fn pull<R: RemoteStore + ?Sized>(
    remote: &R,
    last_known: &RemoteSnapshot,
) -> Result<PullResult> {
    let reference = remote.get_reference().await?;
    if !reference.is_empty() && &reference == last_known.reference() {
        debug!("Remote still at {}; nothing to pull", reference);
        return Ok(PullResult::unchanged(last_known));
    }

    let entries = remote.get_tree(&reference).await?;
    let snapshot = RemoteSnapshot::new(reference, entries);

    let mut changed: Vec<ChangedFile> = last_known
        .paths()
        .filter(|path| !snapshot.contains(path))
        .map(|path| ChangedFile::Removed {
            path: path.to_string(),
        })
        .collect();
    let mut skipped = Vec::new();

    for entry in snapshot.entries() {
        if last_known.hash_of(&entry.path) == Some(&entry.hash) {
            continue;
        }
        match remote.get_content(&entry.path).await {
            Ok(file) => changed.push(ChangedFile::Updated {
                path: entry.path.clone(),
                content: file.content,
                hash: file.hash,
            }),
            Err(err) if err.is_per_path() => {
                warn!("Skipping {}: {}", entry.path, err);
                skipped.push((entry.path.clone(), err));
            }
            Err(err) => return Err(err.into()),
        }
    }

    debug!(
        "Pulled {}: {} changed, {} skipped",
        snapshot.reference(),
        changed.len(),
        skipped.len()
    );

    Ok(PullResult {
        changed,
        skipped,
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, RemoteCall, RemoteOp};

    async fn snapshot_of(remote: &InMemoryRemote) -> RemoteSnapshot {
        let head = remote.get_reference().await.unwrap();
        let files = remote.get_tree(&head).await.unwrap();
        remote.clear_calls();
        RemoteSnapshot::new(head, files)
    }

    fn content_fetches(remote: &InMemoryRemote) -> Vec<String> {
        remote
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::GetContent(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_pull_fetches_everything() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("a.md", Some("a")), ("b/c.md", Some("c"))], "seed");

        let result = pull(&remote, &RemoteSnapshot::empty()).await.unwrap();

        assert_eq!(result.changed.len(), 2);
        assert_eq!(
            result.changed[0],
            ChangedFile::Updated {
                path: "a.md".into(),
                content: b"a".to_vec(),
                hash: ContentHash::of(b"a"),
            }
        );
        assert_eq!(result.snapshot.reference(), &remote.head());
        assert_eq!(result.snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_pull_fetches_only_changed_paths() {
        let remote = InMemoryRemote::new();
        remote.commit_files(
            &[
                ("same.md", Some("same")),
                ("edited.md", Some("v1")),
                ("removed.md", Some("bye")),
            ],
            "seed",
        );
        let last_known = snapshot_of(&remote).await;

        remote.commit_files(&[("edited.md", Some("v2")), ("removed.md", None)], "external");

        let result = pull(&remote, &last_known).await.unwrap();

        assert_eq!(content_fetches(&remote), vec!["edited.md"]);
        assert_eq!(result.changed.len(), 2);
        assert_eq!(
            result.changed[0],
            ChangedFile::Removed {
                path: "removed.md".into()
            }
        );
        assert_eq!(result.changed[1].path(), "edited.md");
        assert_eq!(result.snapshot.reference(), &remote.head());
        assert!(!result.snapshot.contains("removed.md"));
        assert_eq!(
            result.snapshot.hash_of("edited.md"),
            Some(&ContentHash::of(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_removals_come_before_updates() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("a", Some("file")), ("z/b.md", Some("nested"))], "seed");
        let last_known = snapshot_of(&remote).await;

        // `a` becomes a directory, `z` becomes a file
        remote.commit_files(
            &[
                ("a", None),
                ("a/b.md", Some("nested")),
                ("z/b.md", None),
                ("z", Some("file")),
            ],
            "swap",
        );

        let result = pull(&remote, &last_known).await.unwrap();

        let order: Vec<(&str, bool)> = result
            .changed
            .iter()
            .map(|c| (c.path(), c.is_removal()))
            .collect();
        assert_eq!(
            order,
            vec![("a", true), ("z/b.md", true), ("a/b.md", false), ("z", false)]
        );
    }

    #[tokio::test]
    async fn test_unchanged_reference_skips_tree_fetch() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("a.md", Some("a"))], "seed");
        let last_known = snapshot_of(&remote).await;

        let result = pull(&remote, &last_known).await.unwrap();

        assert!(result.changed.is_empty());
        assert_eq!(result.snapshot, last_known);
        assert_eq!(remote.calls(), vec![RemoteCall::GetReference]);
    }

    #[tokio::test]
    async fn test_per_path_failures_are_skipped() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("dir.md", Some("x")), ("ok.md", Some("ok"))], "seed");
        remote.mark_not_a_file("dir.md");

        let result = pull(&remote, &RemoteSnapshot::empty()).await.unwrap();

        assert_eq!(result.changed.len(), 1);
        assert_eq!(result.changed[0].path(), "ok.md");
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].0, "dir.md");
        assert!(matches!(result.skipped[0].1, RemoteError::NotAFile(_)));
        // The snapshot still reflects the whole remote tree
        assert!(result.snapshot.contains("dir.md"));
    }

    #[tokio::test]
    async fn test_transport_failure_aborts() {
        let remote = InMemoryRemote::new();
        remote.commit_files(&[("a.md", Some("a"))], "seed");
        remote.fail_on(RemoteOp::GetContent, RemoteError::Auth("token expired".into()));

        let err = pull(&remote, &RemoteSnapshot::empty()).await.unwrap_err();
        assert!(matches!(err, PullError::Remote(RemoteError::Auth(_))));
    }
}
