//! The engine's cached view of the remote repository.

use crate::hash::ContentHash;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Identifier of a commit object in the remote store.
///
/// The empty id stands for "no commit known yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Git file mode of a blob entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileMode {
    #[default]
    #[serde(rename = "100644")]
    Regular,
    #[serde(rename = "100755")]
    Executable,
    #[serde(rename = "120000")]
    Symlink,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
        }
    }

    /// Parse a tree mode; `None` for anything that is not a blob mode.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "100644" => Some(FileMode::Regular),
            "100755" => Some(FileMode::Executable),
            "120000" => Some(FileMode::Symlink),
            _ => None,
        }
    }

    pub fn is_regular(&self) -> bool {
        *self == FileMode::Regular
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file in a remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub hash: ContentHash,
    pub mode: FileMode,
    /// API url of the blob, when the store reports one
    pub url: Option<String>,
}

impl TreeEntry {
    pub fn new(path: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            hash,
            mode: FileMode::Regular,
            url: None,
        }
    }

    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Last-known remote reference plus its flattened tree.
///
/// Replaced wholesale after a successful pull or push; never patched entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    reference: CommitId,
    tree: BTreeMap<String, TreeEntry>,
}

impl RemoteSnapshot {
    /// Snapshot with no reference and no files.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(reference: CommitId, entries: impl IntoIterator<Item = TreeEntry>) -> Self {
        let tree = entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        Self { reference, tree }
    }

    pub fn reference(&self) -> &CommitId {
        &self.reference
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.tree.get(path)
    }

    /// Last-known blob hash for `path`.
    pub fn hash_of(&self, path: &str) -> Option<&ContentHash> {
        self.tree.get(path).map(|entry| &entry.hash)
    }

    /// Last-known mode for `path`; regular for unknown paths.
    pub fn mode_of(&self, path: &str) -> FileMode {
        self.tree
            .get(path)
            .map(|entry| entry.mode)
            .unwrap_or_default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.tree.contains_key(path)
    }

    /// Entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &TreeEntry> {
        self.tree.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.tree.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = RemoteSnapshot::new(
            CommitId::from("abc"),
            vec![
                TreeEntry::new("b.md", ContentHash::of(b"b")),
                TreeEntry::new("a.md", ContentHash::of(b"a")),
            ],
        );

        assert_eq!(snapshot.reference().as_str(), "abc");
        assert_eq!(snapshot.hash_of("a.md"), Some(&ContentHash::of(b"a")));
        assert!(snapshot.hash_of("missing.md").is_none());
        assert_eq!(snapshot.paths().collect::<Vec<_>>(), vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_mode_lookup() {
        let snapshot = RemoteSnapshot::new(
            CommitId::from("abc"),
            vec![TreeEntry::new("run.sh", ContentHash::of(b"#!")).with_mode(FileMode::Executable)],
        );

        assert_eq!(snapshot.mode_of("run.sh"), FileMode::Executable);
        assert_eq!(snapshot.mode_of("missing.md"), FileMode::Regular);
        assert_eq!(FileMode::parse("100755"), Some(FileMode::Executable));
        assert_eq!(FileMode::parse("040000"), None);
        assert_eq!(
            serde_json::to_string(&FileMode::Symlink).unwrap(),
            "\"120000\""
        );
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = RemoteSnapshot::empty();
        assert!(snapshot.reference().is_empty());
        assert!(snapshot.is_empty());
    }
}
